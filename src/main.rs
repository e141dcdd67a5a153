//! Composition root: configuration, logging, storage, the acquisition
//! stack, and the operator HTTP server.
//!
//! Exit codes: 0 normal, 2 configuration error, 3 authentication failure on
//! startup, 4 database schema mismatch.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use medprice::api::server::{self, AppContext};
use medprice::application::acquisition::{AcquireOptions, AcquisitionOrchestrator, OfferHarvester};
use medprice::application::analytics::AnalyticsService;
use medprice::application::ingest::{IngestOptions, IngestService};
use medprice::application::monitor::MonitorService;
use medprice::application::scheduler::{AcquireAndIngest, BatchScheduler, SchedulerConfig};
use medprice::infrastructure::browser_harvester::{BrowserHarvester, BrowserHarvesterConfig};
use medprice::infrastructure::config::AppConfig;
use medprice::infrastructure::credential_broker::CredentialBroker;
use medprice::infrastructure::database_connection::{DatabaseConnection, SchemaMismatch};
use medprice::infrastructure::drug_repository::DrugRepository;
use medprice::infrastructure::http_client::{HttpClient, HttpClientConfig};
use medprice::infrastructure::logging::init_logging;
use medprice::infrastructure::price_repository::PriceRepository;
use medprice::infrastructure::task_repository::TaskRepository;
use medprice::infrastructure::upstream_client::UpstreamClient;

const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_SCHEMA: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _log_guard = match init_logging(&config.log_filter) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    info!("starting medprice against {}", config.base_url);

    // Storage.
    let db = DatabaseConnection::new(&config.database_url).await?;
    if let Err(e) = db.migrate().await {
        if e.downcast_ref::<SchemaMismatch>().is_some() {
            error!("{e}");
            return Ok(ExitCode::from(EXIT_SCHEMA));
        }
        return Err(e);
    }
    let pool = db.pool().clone();
    let drugs = DrugRepository::new(pool.clone());
    let prices = PriceRepository::new(pool.clone());
    let tasks = TaskRepository::new(pool);

    // Upstream stack.
    let http = Arc::new(HttpClient::new(HttpClientConfig {
        max_requests_per_second: config.rate_limit_rps,
        origin: config.base_url.clone(),
        ..Default::default()
    })?);
    let broker = Arc::new(CredentialBroker::new(
        Arc::clone(&http),
        config.base_url.clone(),
        config.phone.clone(),
        config.password.clone(),
        config.token_cache_path.clone(),
    ));

    // Startup credential check: with credentials (or a pre-seeded cache)
    // the broker must be able to hand out a token now rather than failing
    // the first scheduled crawl.
    match broker.get(&CancellationToken::new()).await {
        Ok(token) => {
            info!("session token ready (expires {})", token.expires_at);
        }
        Err(_) if !config.has_credentials() => {
            warn!("no credentials configured; crawling will fail until a token cache is seeded");
        }
        Err(e) => {
            error!("startup authentication failed: {e}");
            return Ok(ExitCode::from(EXIT_AUTH));
        }
    }

    let upstream = Arc::new(UpstreamClient::new(
        Arc::clone(&http),
        Arc::clone(&broker),
        config.base_url.clone(),
    ));
    let harvester = Arc::new(BrowserHarvester::new(BrowserHarvesterConfig {
        base_url: config.base_url.clone(),
        max_contexts: config.browser_concurrency,
        ..Default::default()
    }));
    if let Ok(token) = broker.get(&CancellationToken::new()).await {
        harvester.set_token(Some(token.token)).await;
    }

    // Application services.
    let harvester_seam: Arc<dyn OfferHarvester> = harvester.clone() as Arc<dyn OfferHarvester>;
    let orchestrator = Arc::new(AcquisitionOrchestrator::new(
        upstream,
        Arc::clone(&harvester_seam),
    ));
    let monitor = Arc::new(MonitorService::new(prices.clone(), tasks.clone()));
    let ingest = Arc::new(IngestService::new(
        drugs.clone(),
        prices.clone(),
        monitor,
        harvester_seam,
    ));
    let runner = Arc::new(AcquireAndIngest {
        orchestrator: Arc::clone(&orchestrator),
        ingest: Arc::clone(&ingest),
        acquire_opts: AcquireOptions {
            min_providers: config.min_providers,
            ..Default::default()
        },
        ingest_opts: IngestOptions::default(),
    });
    let scheduler = BatchScheduler::new(
        runner,
        tasks.clone(),
        SchedulerConfig {
            concurrency: config.concurrency,
            ..Default::default()
        },
    );
    let analytics = Arc::new(AnalyticsService::new(drugs, prices, tasks.clone()));

    let ctx = AppContext {
        orchestrator,
        ingest,
        scheduler,
        analytics,
        tasks,
        config: Arc::new(config),
    };
    server::run(ctx).await?;

    Ok(ExitCode::SUCCESS)
}
