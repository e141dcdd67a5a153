//! HTTP server setup and routing for the operator console.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::application::acquisition::AcquisitionOrchestrator;
use crate::application::analytics::AnalyticsService;
use crate::application::ingest::IngestService;
use crate::application::scheduler::BatchScheduler;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::task_repository::TaskRepository;

/// Shared application context handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub orchestrator: Arc<AcquisitionOrchestrator>,
    pub ingest: Arc<IngestService>,
    pub scheduler: Arc<BatchScheduler>,
    pub analytics: Arc<AnalyticsService>,
    pub tasks: TaskRepository,
    pub config: Arc<AppConfig>,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        // Acquisition
        .route("/crawl/quick", post(super::handlers::crawl_quick))
        .route("/crawl/full", post(super::handlers::crawl_full))
        .route("/crawl/smart", post(super::handlers::crawl_smart))
        .route("/crawl/batch", post(super::handlers::crawl_batch))
        // Tasks
        .route("/tasks", get(super::handlers::list_tasks))
        .route("/tasks/:id", get(super::handlers::get_task))
        .route("/tasks/:id", delete(super::handlers::cancel_task))
        // Watch list
        .route("/watchlist", get(super::handlers::list_watchlist))
        .route("/watchlist", post(super::handlers::add_watchlist))
        .route("/watchlist/:id", delete(super::handlers::remove_watchlist))
        // Analytics
        .route("/search", get(super::handlers::search))
        .route("/drugs", get(super::handlers::list_drugs))
        .route("/drugs/:id/prices", get(super::handlers::drug_prices))
        .route("/compare", get(super::handlers::compare))
        .route("/monitor/alerts", get(super::handlers::alerts))
        .route("/monitor/rules", post(super::handlers::create_rule))
        .route("/statistics", get(super::handlers::statistics))
        // Progress push channel
        .route("/events", get(super::handlers::event_stream))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn run(ctx: AppContext) -> anyhow::Result<()> {
    let addr = ctx.config.listen_addr;
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("operator console listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
