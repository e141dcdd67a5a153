//! Repository for crawl tasks, the watch list, monitor rules, and alerts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::entities::{
    Alert, CrawlTask, MonitorRule, MonitorRuleKind, TaskStatus, WatchListItem,
};
use crate::errors::{CrawlError, CrawlResult};

#[derive(Clone)]
pub struct TaskRepository {
    pool: Arc<SqlitePool>,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Crawl tasks
    // ------------------------------------------------------------------

    pub async fn create_task(&self, name: &str, keywords: &[String]) -> CrawlResult<i64> {
        if keywords.is_empty() {
            return Err(CrawlError::InvalidInput("task needs at least one keyword".into()));
        }
        let keywords_json = serde_json::to_string(keywords)
            .map_err(|e| CrawlError::InvalidInput(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO crawl_tasks (name, keywords, status, total_keywords, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(keywords_json)
        .bind(TaskStatus::Pending)
        .bind(keywords.len() as i64)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_task(&self, id: i64) -> CrawlResult<Option<CrawlTask>> {
        let row = sqlx::query("SELECT * FROM crawl_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        row.map(map_task).transpose()
    }

    pub async fn list_tasks(&self, limit: i64) -> CrawlResult<Vec<CrawlTask>> {
        let rows = sqlx::query("SELECT * FROM crawl_tasks ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;
        rows.into_iter().map(map_task).collect()
    }

    pub async fn mark_task_running(&self, id: i64) -> CrawlResult<()> {
        sqlx::query("UPDATE crawl_tasks SET status = ?, started_at = ? WHERE id = ?")
            .bind(TaskStatus::Running)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_task_terminal(
        &self,
        id: i64,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> CrawlResult<()> {
        sqlx::query(
            "UPDATE crawl_tasks SET status = ?, completed_at = ?,
             last_error = COALESCE(?, last_error) WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(last_error)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Per-keyword success: bump completed and the item total.
    pub async fn record_keyword_success(&self, id: i64, items: u64) -> CrawlResult<()> {
        sqlx::query(
            "UPDATE crawl_tasks SET completed_keywords = completed_keywords + 1,
             total_items = total_items + ? WHERE id = ?",
        )
        .bind(items as i64)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Per-keyword failure: bump failed and remember the most recent error.
    pub async fn record_keyword_failure(&self, id: i64, error: &str) -> CrawlResult<()> {
        sqlx::query(
            "UPDATE crawl_tasks SET failed_keywords = failed_keywords + 1,
             last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watch list
    // ------------------------------------------------------------------

    pub async fn add_watch_keyword(
        &self,
        keyword: &str,
        category_hint: Option<&str>,
        priority: i64,
    ) -> CrawlResult<i64> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(CrawlError::InvalidInput("keyword must not be empty".into()));
        }
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM watch_list WHERE keyword = ?")
            .bind(keyword)
            .fetch_optional(&*self.pool)
            .await?;
        if let Some(id) = existing {
            sqlx::query(
                "UPDATE watch_list SET category_hint = COALESCE(?, category_hint),
                 priority = ?, enabled = 1 WHERE id = ?",
            )
            .bind(category_hint)
            .bind(priority)
            .bind(id)
            .execute(&*self.pool)
            .await?;
            return Ok(id);
        }
        let result = sqlx::query(
            "INSERT INTO watch_list (keyword, category_hint, priority, enabled, added_at)
             VALUES (?, ?, ?, 1, ?)",
        )
        .bind(keyword)
        .bind(category_hint)
        .bind(priority)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn remove_watch_keyword(&self, id: i64) -> CrawlResult<bool> {
        let result = sqlx::query("DELETE FROM watch_list WHERE id = ?")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enabled watch keywords, urgent first, least-recently-crawled first
    /// within the same priority.
    pub async fn list_watch_keywords(&self, enabled_only: bool) -> CrawlResult<Vec<WatchListItem>> {
        let sql = if enabled_only {
            "SELECT * FROM watch_list WHERE enabled = 1
             ORDER BY priority DESC, last_crawled_at ASC NULLS FIRST, id ASC"
        } else {
            "SELECT * FROM watch_list ORDER BY priority DESC, id ASC"
        };
        let rows = sqlx::query(sql).fetch_all(&*self.pool).await?;
        Ok(rows.into_iter().map(map_watch_item).collect())
    }

    pub async fn touch_watch_keyword(&self, keyword: &str) -> CrawlResult<()> {
        sqlx::query("UPDATE watch_list SET last_crawled_at = ? WHERE keyword = ?")
            .bind(Utc::now())
            .bind(keyword)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Monitor rules and alerts
    // ------------------------------------------------------------------

    pub async fn create_rule(
        &self,
        drug_id: i64,
        kind: MonitorRuleKind,
        threshold_pct: f64,
    ) -> CrawlResult<i64> {
        let result = sqlx::query(
            "INSERT INTO monitor_rules (drug_id, kind, threshold_pct, enabled, created_at)
             VALUES (?, ?, ?, 1, ?)",
        )
        .bind(drug_id)
        .bind(kind)
        .bind(threshold_pct)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn rules_for_drug(&self, drug_id: i64) -> CrawlResult<Vec<MonitorRule>> {
        let rows =
            sqlx::query("SELECT * FROM monitor_rules WHERE drug_id = ? AND enabled = 1")
                .bind(drug_id)
                .fetch_all(&*self.pool)
                .await?;
        Ok(rows.into_iter().map(map_rule).collect())
    }

    pub async fn insert_alert(
        &self,
        drug_id: i64,
        rule_kind: MonitorRuleKind,
        message: &str,
        old_price_cents: Option<i64>,
        new_price_cents: Option<i64>,
        change_pct: Option<f64>,
    ) -> CrawlResult<i64> {
        let result = sqlx::query(
            "INSERT INTO alerts
             (drug_id, rule_kind, message, old_price_cents, new_price_cents, change_pct, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(drug_id)
        .bind(rule_kind)
        .bind(message)
        .bind(old_price_cents)
        .bind(new_price_cents)
        .bind(change_pct)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_alerts(&self, days: i64) -> CrawlResult<Vec<Alert>> {
        let since = Utc::now() - Duration::days(days.max(0));
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE created_at >= ? ORDER BY created_at DESC, id DESC",
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.into_iter().map(map_alert).collect())
    }

    pub async fn count_tasks_by_status(&self, status: TaskStatus) -> CrawlResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM crawl_tasks WHERE status = ?")
                .bind(status)
                .fetch_one(&*self.pool)
                .await?,
        )
    }
}

fn map_task(row: sqlx::sqlite::SqliteRow) -> CrawlResult<CrawlTask> {
    let keywords_json: String = row.get("keywords");
    let keywords: Vec<String> = serde_json::from_str(&keywords_json)
        .map_err(|e| CrawlError::InvalidInput(format!("corrupt keyword list: {e}")))?;
    Ok(CrawlTask {
        id: row.get("id"),
        name: row.get("name"),
        keywords,
        status: row.get("status"),
        total_keywords: row.get("total_keywords"),
        completed_keywords: row.get("completed_keywords"),
        failed_keywords: row.get("failed_keywords"),
        total_items: row.get("total_items"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn map_watch_item(row: sqlx::sqlite::SqliteRow) -> WatchListItem {
    WatchListItem {
        id: row.get("id"),
        keyword: row.get("keyword"),
        category_hint: row.get("category_hint"),
        priority: row.get("priority"),
        enabled: row.get::<i64, _>("enabled") != 0,
        added_at: row.get("added_at"),
        last_crawled_at: row.get("last_crawled_at"),
    }
}

fn map_rule(row: sqlx::sqlite::SqliteRow) -> MonitorRule {
    MonitorRule {
        id: row.get("id"),
        drug_id: row.get("drug_id"),
        kind: row.get("kind"),
        threshold_pct: row.get("threshold_pct"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: row.get("created_at"),
    }
}

fn map_alert(row: sqlx::sqlite::SqliteRow) -> Alert {
    Alert {
        id: row.get("id"),
        drug_id: row.get("drug_id"),
        rule_kind: row.get("rule_kind"),
        message: row.get("message"),
        old_price_cents: row.get("old_price_cents"),
        new_price_cents: row.get("new_price_cents"),
        change_pct: row.get("change_pct"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::memory_pool;

    #[tokio::test]
    async fn task_lifecycle_and_counters() {
        let repo = TaskRepository::new(memory_pool().await);
        let keywords = vec!["阿莫西林".to_string(), "布洛芬".to_string()];
        let id = repo.create_task("每日采集", &keywords).await.unwrap();

        let task = repo.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.total_keywords, 2);
        assert_eq!(task.keywords, keywords);

        repo.mark_task_running(id).await.unwrap();
        repo.record_keyword_success(id, 12).await.unwrap();
        repo.record_keyword_failure(id, "timeout").await.unwrap();
        repo.mark_task_terminal(id, TaskStatus::Succeeded, None)
            .await
            .unwrap();

        let task = repo.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.completed_keywords, 1);
        assert_eq!(task.failed_keywords, 1);
        assert_eq!(task.total_items, 12);
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
        assert!(task.completed_at.is_some());
        // Accounting invariant on terminal status.
        assert_eq!(
            task.completed_keywords + task.failed_keywords,
            task.total_keywords
        );
    }

    #[tokio::test]
    async fn empty_keyword_set_is_rejected() {
        let repo = TaskRepository::new(memory_pool().await);
        assert!(repo.create_task("empty", &[]).await.is_err());
    }

    #[tokio::test]
    async fn watch_list_upserts_by_keyword() {
        let repo = TaskRepository::new(memory_pool().await);
        let a = repo.add_watch_keyword("阿莫西林", None, 0).await.unwrap();
        let b = repo
            .add_watch_keyword("阿莫西林", Some("drug"), 2)
            .await
            .unwrap();
        assert_eq!(a, b);

        let items = repo.list_watch_keywords(true).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].priority, 2);
        assert_eq!(items[0].category_hint.as_deref(), Some("drug"));

        assert!(repo.remove_watch_keyword(a).await.unwrap());
        assert!(!repo.remove_watch_keyword(a).await.unwrap());
    }

    #[tokio::test]
    async fn watch_list_orders_by_priority_then_staleness() {
        let repo = TaskRepository::new(memory_pool().await);
        repo.add_watch_keyword("normal", None, 0).await.unwrap();
        repo.add_watch_keyword("urgent", None, 2).await.unwrap();
        repo.add_watch_keyword("important", None, 1).await.unwrap();
        repo.touch_watch_keyword("urgent").await.unwrap();

        let items = repo.list_watch_keywords(true).await.unwrap();
        let order: Vec<&str> = items.iter().map(|i| i.keyword.as_str()).collect();
        assert_eq!(order, vec!["urgent", "important", "normal"]);
    }

    #[tokio::test]
    async fn alerts_filter_by_window() {
        let pool = memory_pool().await;
        sqlx::query(
            "INSERT INTO drugs (name, specification, manufacturer, created_at, updated_at)
             VALUES ('d', '', '', ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        let repo = TaskRepository::new(pool.clone());

        repo.insert_alert(1, MonitorRuleKind::PriceDrop, "跌价 12%", Some(1000), Some(880), Some(-12.0))
            .await
            .unwrap();
        sqlx::query("UPDATE alerts SET created_at = ?")
            .bind(Utc::now() - Duration::days(10))
            .execute(&pool)
            .await
            .unwrap();
        repo.insert_alert(1, MonitorRuleKind::NewSupplier, "新供应商", None, Some(900), None)
            .await
            .unwrap();

        assert_eq!(repo.list_alerts(7).await.unwrap().len(), 1);
        assert_eq!(repo.list_alerts(30).await.unwrap().len(), 2);
    }
}
