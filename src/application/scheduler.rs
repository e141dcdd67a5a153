//! Batch scheduler: drives keyword sets through the acquisition pipeline
//! with a bounded worker pool, per-keyword retries, task accounting, and
//! cooperative cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::acquisition::{AcquireOptions, AcquisitionOrchestrator};
use crate::application::ingest::{IngestOptions, IngestService};
use crate::domain::entities::TaskStatus;
use crate::domain::events::{CrawlPhase, ProgressEvent};
use crate::errors::{CrawlError, CrawlResult};
use crate::infrastructure::task_repository::TaskRepository;

/// One keyword's unit of work: acquire, ingest, report rows written.
/// Seam so scheduler behavior is testable without the network stack.
#[async_trait]
pub trait KeywordRunner: Send + Sync {
    async fn run_keyword(&self, keyword: &str, cancel: &CancellationToken) -> CrawlResult<u64>;
}

/// Production runner: hybrid acquisition followed by ingest.
pub struct AcquireAndIngest {
    pub orchestrator: Arc<AcquisitionOrchestrator>,
    pub ingest: Arc<IngestService>,
    pub acquire_opts: AcquireOptions,
    pub ingest_opts: IngestOptions,
}

#[async_trait]
impl KeywordRunner for AcquireAndIngest {
    async fn run_keyword(&self, keyword: &str, cancel: &CancellationToken) -> CrawlResult<u64> {
        let result = self
            .orchestrator
            .acquire_suppliers_for_keyword(keyword, &self.acquire_opts, cancel)
            .await?;
        let summary = self
            .ingest
            .persist_result(&result, &self.ingest_opts, cancel)
            .await?;
        Ok(summary.prices_inserted)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub concurrency: usize,
    /// Retries per keyword on recoverable errors.
    pub keyword_retries: u32,
    /// Hard budget for one keyword including retries.
    pub keyword_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            keyword_retries: 2,
            keyword_timeout: Duration::from_secs(180),
        }
    }
}

pub struct BatchScheduler {
    runner: Arc<dyn KeywordRunner>,
    tasks: TaskRepository,
    config: SchedulerConfig,
    progress: broadcast::Sender<ProgressEvent>,
    running: Mutex<HashMap<i64, CancellationToken>>,
}

impl BatchScheduler {
    pub fn new(runner: Arc<dyn KeywordRunner>, tasks: TaskRepository, config: SchedulerConfig) -> Arc<Self> {
        let (progress, _) = broadcast::channel(256);
        Arc::new(Self {
            runner,
            tasks,
            config,
            progress,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to structured progress events. Slow consumers lag and drop;
    /// they never block the workers.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Start a pending task in the background. Returns immediately.
    pub async fn start_task(self: &Arc<Self>, task_id: i64) -> CrawlResult<()> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| CrawlError::InvalidInput(format!("task {task_id} not found")))?;
        if task.status != TaskStatus::Pending && task.status != TaskStatus::Paused {
            return Err(CrawlError::InvalidInput(format!(
                "task {task_id} is {}, not startable",
                task.status.as_str()
            )));
        }

        let cancel = CancellationToken::new();
        self.running.lock().await.insert(task_id, cancel.clone());
        self.tasks.mark_task_running(task_id).await?;

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drive_task(task_id, task.keywords, cancel).await;
        });
        Ok(())
    }

    /// Request cancellation. In-flight keywords observe it at their next
    /// suspension point; the driver settles the final status.
    pub async fn cancel_task(&self, task_id: i64) -> CrawlResult<bool> {
        let running = self.running.lock().await;
        match running.get(&task_id) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn drive_task(self: Arc<Self>, task_id: i64, keywords: Vec<String>, cancel: CancellationToken) {
        info!("task {task_id}: starting with {} keywords", keywords.len());
        let pool = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();

        for keyword in keywords {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match Arc::clone(&pool).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if cancel.is_cancelled() {
                break;
            }

            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                scheduler.run_one_keyword(task_id, &keyword, &cancel).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let status = if cancel.is_cancelled() {
            TaskStatus::Cancelled
        } else {
            match self.tasks.get_task(task_id).await {
                Ok(Some(task)) if task.completed_keywords == 0 && task.failed_keywords > 0 => {
                    TaskStatus::Failed
                }
                _ => TaskStatus::Succeeded,
            }
        };
        if let Err(e) = self.tasks.mark_task_terminal(task_id, status, None).await {
            warn!("task {task_id}: failed to record terminal status: {e}");
        }
        self.running.lock().await.remove(&task_id);
        info!("task {task_id}: finished as {}", status.as_str());
    }

    async fn run_one_keyword(&self, task_id: i64, keyword: &str, cancel: &CancellationToken) {
        self.emit(ProgressEvent::new(task_id, keyword, CrawlPhase::Started));

        let work = self.keyword_with_retries(keyword, cancel);
        let outcome = tokio::time::timeout(self.config.keyword_timeout, work)
            .await
            .unwrap_or(Err(CrawlError::browser("keyword budget exhausted")));

        match outcome {
            Ok(items) => {
                if let Err(e) = self.tasks.record_keyword_success(task_id, items).await {
                    warn!("task {task_id}: accounting failed: {e}");
                }
                let _ = self.tasks.touch_watch_keyword(keyword).await;
                self.emit(
                    ProgressEvent::new(task_id, keyword, CrawlPhase::Finished).with_items(items),
                );
            }
            Err(CrawlError::Cancelled) => {
                // Cancelled keywords are neither completed nor failed; the
                // driver settles the task status.
                self.emit(
                    ProgressEvent::new(task_id, keyword, CrawlPhase::Finished).failed("cancelled"),
                );
            }
            Err(err) => {
                if let Err(e) = self
                    .tasks
                    .record_keyword_failure(task_id, &err.to_string())
                    .await
                {
                    warn!("task {task_id}: accounting failed: {e}");
                }
                self.emit(
                    ProgressEvent::new(task_id, keyword, CrawlPhase::Finished)
                        .failed(err.to_string()),
                );
            }
        }
    }

    async fn keyword_with_retries(&self, keyword: &str, cancel: &CancellationToken) -> CrawlResult<u64> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.runner.run_keyword(keyword, cancel).await {
                Ok(items) => return Ok(items),
                Err(err @ CrawlError::Cancelled) => return Err(err),
                // One refresh already happened inside the client; a second
                // auth failure is terminal for the keyword.
                Err(err @ CrawlError::Auth) => return Err(err),
                Err(err) if err.is_recoverable() && attempt <= self.config.keyword_retries => {
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| Duration::from_secs(attempt as u64));
                    warn!("[{keyword}] attempt {attempt} failed ({err}), retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.progress.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::memory_pool;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runner whose behavior is scripted per keyword.
    struct ScriptedRunner {
        /// keyword -> (failures before success, items on success)
        script: HashMap<String, (u32, u64)>,
        attempts: Mutex<HashMap<String, u32>>,
        delay: Duration,
        started: AtomicU32,
    }

    impl ScriptedRunner {
        fn new(script: HashMap<String, (u32, u64)>) -> Self {
            Self {
                script,
                attempts: Mutex::new(HashMap::new()),
                delay: Duration::from_millis(0),
                started: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl KeywordRunner for ScriptedRunner {
        async fn run_keyword(&self, keyword: &str, cancel: &CancellationToken) -> CrawlResult<u64> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                }
            }
            if cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            let mut attempts = self.attempts.lock().await;
            let n = attempts.entry(keyword.to_string()).or_insert(0);
            *n += 1;
            match self.script.get(keyword) {
                Some((failures, items)) if *n > *failures => Ok(*items),
                Some(_) => Err(CrawlError::upstream_client(502, "upstream hiccup")),
                None => Err(CrawlError::Auth),
            }
        }
    }

    async fn wait_terminal(tasks: &TaskRepository, id: i64) -> crate::domain::entities::CrawlTask {
        for _ in 0..1000 {
            let task = tasks.get_task(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached a terminal status");
    }

    #[tokio::test]
    async fn successful_batch_accounts_every_keyword() {
        let tasks = TaskRepository::new(memory_pool().await);
        let script = HashMap::from([
            ("阿莫西林".to_string(), (0, 12u64)),
            ("布洛芬".to_string(), (0, 7u64)),
        ]);
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedRunner::new(script)),
            tasks.clone(),
            SchedulerConfig::default(),
        );

        let id = tasks
            .create_task("daily", &["阿莫西林".into(), "布洛芬".into()])
            .await
            .unwrap();
        scheduler.start_task(id).await.unwrap();

        let task = wait_terminal(&tasks, id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.completed_keywords, 2);
        assert_eq!(task.failed_keywords, 0);
        assert_eq!(task.total_items, 19);
        assert_eq!(
            task.completed_keywords + task.failed_keywords,
            task.total_keywords
        );
    }

    #[tokio::test]
    async fn recoverable_failures_are_retried_then_succeed() {
        let tasks = TaskRepository::new(memory_pool().await);
        let script = HashMap::from([("天麻".to_string(), (2, 5u64))]);
        let runner = Arc::new(ScriptedRunner::new(script));
        let scheduler = BatchScheduler::new(
            runner.clone(),
            tasks.clone(),
            SchedulerConfig {
                keyword_retries: 2,
                ..Default::default()
            },
        );

        let id = tasks.create_task("retry", &["天麻".into()]).await.unwrap();
        scheduler.start_task(id).await.unwrap();

        let task = wait_terminal(&tasks, id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.completed_keywords, 1);
        assert_eq!(runner.started.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_terminal_for_the_keyword_not_the_task() {
        let tasks = TaskRepository::new(memory_pool().await);
        // "好药" succeeds; the unscripted keyword hits Auth and must not
        // be retried.
        let script = HashMap::from([("好药".to_string(), (0, 3u64))]);
        let runner = Arc::new(ScriptedRunner::new(script));
        let scheduler = BatchScheduler::new(runner.clone(), tasks.clone(), SchedulerConfig::default());

        let id = tasks
            .create_task("mixed", &["好药".into(), "无权限".into()])
            .await
            .unwrap();
        scheduler.start_task(id).await.unwrap();

        let task = wait_terminal(&tasks, id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.completed_keywords, 1);
        assert_eq!(task.failed_keywords, 1);
        assert!(task.last_error.unwrap().contains("credential"));
        // One attempt for the auth keyword, one for the good one.
        assert_eq!(runner.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_keyword_failed() {
        let tasks = TaskRepository::new(memory_pool().await);
        let script = HashMap::from([("顽固".to_string(), (99, 0u64))]);
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedRunner::new(script)),
            tasks.clone(),
            SchedulerConfig {
                keyword_retries: 1,
                ..Default::default()
            },
        );

        let id = tasks.create_task("fail", &["顽固".into()]).await.unwrap();
        scheduler.start_task(id).await.unwrap();

        let task = wait_terminal(&tasks, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failed_keywords, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_batch_cleanly() {
        let tasks = TaskRepository::new(memory_pool().await);
        let keywords: Vec<String> = (0..20).map(|i| format!("关键词{i}")).collect();
        let script: HashMap<String, (u32, u64)> =
            keywords.iter().map(|k| (k.clone(), (0, 1u64))).collect();
        let mut runner = ScriptedRunner::new(script);
        runner.delay = Duration::from_millis(30);
        let runner = Arc::new(runner);
        let scheduler = BatchScheduler::new(
            runner.clone(),
            tasks.clone(),
            SchedulerConfig {
                concurrency: 1,
                ..Default::default()
            },
        );

        let id = tasks.create_task("big", &keywords).await.unwrap();
        scheduler.start_task(id).await.unwrap();

        // Let roughly five keywords finish, then cancel.
        tokio::time::sleep(Duration::from_millis(170)).await;
        assert!(scheduler.cancel_task(id).await.unwrap());

        let task = wait_terminal(&tasks, id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_keywords >= 1);
        assert!(task.completed_keywords < 20);
        assert!(task.completed_keywords + task.failed_keywords <= task.total_keywords);
        // Cancelling an already-terminal task is a no-op.
        assert!(!scheduler.cancel_task(id).await.unwrap());
    }

    #[tokio::test]
    async fn progress_events_flow_to_subscribers() {
        let tasks = TaskRepository::new(memory_pool().await);
        let script = HashMap::from([("阿莫西林".to_string(), (0, 4u64))]);
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedRunner::new(script)),
            tasks.clone(),
            SchedulerConfig::default(),
        );
        let mut rx = scheduler.subscribe();

        let id = tasks.create_task("events", &["阿莫西林".into()]).await.unwrap();
        scheduler.start_task(id).await.unwrap();
        wait_terminal(&tasks, id).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.phase, CrawlPhase::Started);
        assert_eq!(first.task_id, id);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.phase, CrawlPhase::Finished);
        assert!(last.ok);
        assert_eq!(last.items, 4);
    }

    #[tokio::test]
    async fn starting_a_running_task_is_rejected() {
        let tasks = TaskRepository::new(memory_pool().await);
        let script = HashMap::from([("慢".to_string(), (0, 1u64))]);
        let mut runner = ScriptedRunner::new(script);
        runner.delay = Duration::from_millis(200);
        let scheduler =
            BatchScheduler::new(Arc::new(runner), tasks.clone(), SchedulerConfig::default());

        let id = tasks.create_task("dup", &["慢".into()]).await.unwrap();
        scheduler.start_task(id).await.unwrap();
        assert!(scheduler.start_task(id).await.is_err());
        wait_terminal(&tasks, id).await;
    }
}
