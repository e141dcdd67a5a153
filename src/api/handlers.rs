//! Operator console endpoints. All JSON; errors map to
//! `{error, message}` bodies with the status dictated by the error kind.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::server::AppContext;
use crate::application::acquisition::{AcquireMethod, AcquireOptions, AcquisitionResult};
use crate::application::ingest::{IngestOptions, IngestSummary};
use crate::domain::entities::{MonitorRuleKind, PriceRecord, ProductCategory};
use crate::domain::normalizer::format_price_yuan;
use crate::errors::CrawlError;

/// CrawlError rendered as an HTTP response.
pub struct ApiError(CrawlError);

impl From<CrawlError> for ApiError {
    fn from(err: CrawlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            CrawlError::InvalidInput(_) | CrawlError::Normalization(_) => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            CrawlError::Auth => (StatusCode::UNAUTHORIZED, "auth"),
            CrawlError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            CrawlError::UpstreamClient { .. } => (StatusCode::BAD_GATEWAY, "upstream_client"),
            CrawlError::UpstreamProtocol { .. } => (StatusCode::BAD_GATEWAY, "upstream_protocol"),
            CrawlError::BrowserHarvest { .. } => (StatusCode::BAD_GATEWAY, "browser_harvest"),
            CrawlError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
            CrawlError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled"),
        };
        let body = json!({"error": kind, "message": self.0.to_string()});
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

// ----------------------------------------------------------------------
// Acquisition endpoints
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub keyword: String,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub min_providers: Option<usize>,
    #[serde(default)]
    pub force_browser: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CrawlResponse {
    pub keyword: String,
    pub method: AcquireMethod,
    pub endpoint_count: usize,
    pub browser_count: usize,
    pub offers: usize,
    pub drugs_touched: u64,
    pub prices_inserted: u64,
    pub dropped_offers: u64,
    pub sample: Vec<serde_json::Value>,
}

fn crawl_response(
    keyword: &str,
    result: &AcquisitionResult,
    summary: &IngestSummary,
) -> CrawlResponse {
    let sample = result
        .offers
        .iter()
        .take(5)
        .map(|o| {
            json!({
                "name": o.name,
                "supplier": o.supplier_name,
                "price": format_price_yuan(o.price_cents),
            })
        })
        .collect();
    CrawlResponse {
        keyword: keyword.to_string(),
        method: result.method,
        endpoint_count: result.endpoint_count,
        browser_count: result.browser_count,
        offers: result.offers.len(),
        drugs_touched: summary.drugs_touched,
        prices_inserted: summary.prices_inserted,
        dropped_offers: summary.dropped_offers,
        sample,
    }
}

async fn crawl_with(
    ctx: &AppContext,
    keyword: &str,
    opts: AcquireOptions,
) -> ApiResult<Json<CrawlResponse>> {
    let cancel = CancellationToken::new();
    let result = ctx
        .orchestrator
        .acquire_suppliers_for_keyword(keyword, &opts, &cancel)
        .await?;
    let summary = ctx
        .ingest
        .persist_result(&result, &IngestOptions::default(), &cancel)
        .await?;
    debug!(
        "[{keyword}] {:?}: {} offers, {} rows written",
        result.method,
        result.offers.len(),
        summary.prices_inserted
    );
    Ok(Json(crawl_response(keyword, &result, &summary)))
}

/// Fast endpoint-only acquisition.
pub async fn crawl_quick(
    State(ctx): State<AppContext>,
    Json(req): Json<CrawlRequest>,
) -> ApiResult<Json<CrawlResponse>> {
    let opts = AcquireOptions {
        endpoint_only: true,
        min_providers: ctx.config.min_providers,
        max_pages: req.max_pages.unwrap_or(3).clamp(1, 10),
        ..Default::default()
    };
    crawl_with(&ctx, &req.keyword, opts).await
}

/// Forced browser pass.
pub async fn crawl_full(
    State(ctx): State<AppContext>,
    Json(req): Json<CrawlRequest>,
) -> ApiResult<Json<CrawlResponse>> {
    let opts = AcquireOptions {
        force_browser: true,
        min_providers: ctx.config.min_providers,
        ..Default::default()
    };
    crawl_with(&ctx, &req.keyword, opts).await
}

/// Hybrid strategy: endpoint first, browser only when insufficient.
pub async fn crawl_smart(
    State(ctx): State<AppContext>,
    Json(req): Json<CrawlRequest>,
) -> ApiResult<Json<CrawlResponse>> {
    let opts = AcquireOptions {
        min_providers: req.min_providers.unwrap_or(ctx.config.min_providers),
        force_browser: req.force_browser.unwrap_or(false),
        ..Default::default()
    };
    crawl_with(&ctx, &req.keyword, opts).await
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Enqueue a keyword set as a background task. An empty keyword list falls
/// back to the enabled watch list.
pub async fn crawl_batch(
    State(ctx): State<AppContext>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut keywords: Vec<String> = req
        .keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        keywords = ctx
            .tasks
            .list_watch_keywords(true)
            .await?
            .into_iter()
            .map(|item| item.keyword)
            .collect();
    }
    let name = req.name.unwrap_or_else(|| "批量采集".to_string());
    let task_id = ctx.tasks.create_task(&name, &keywords).await?;
    ctx.scheduler.start_task(task_id).await?;
    Ok(Json(json!({"task_id": task_id})))
}

// ----------------------------------------------------------------------
// Tasks
// ----------------------------------------------------------------------

pub async fn list_tasks(State(ctx): State<AppContext>) -> ApiResult<Json<serde_json::Value>> {
    let tasks = ctx.tasks.list_tasks(50).await?;
    Ok(Json(json!({"tasks": tasks})))
}

pub async fn get_task(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    match ctx.tasks.get_task(id).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(not_found("task")),
    }
}

pub async fn cancel_task(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = ctx.scheduler.cancel_task(id).await?;
    Ok(Json(json!({"task_id": id, "cancelling": cancelled})))
}

// ----------------------------------------------------------------------
// Watch list
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WatchRequest {
    pub keyword: String,
    #[serde(default)]
    pub category_hint: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

pub async fn list_watchlist(State(ctx): State<AppContext>) -> ApiResult<Json<serde_json::Value>> {
    let items = ctx.tasks.list_watch_keywords(false).await?;
    Ok(Json(json!({"watchlist": items})))
}

pub async fn add_watchlist(
    State(ctx): State<AppContext>,
    Json(req): Json<WatchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = ctx
        .tasks
        .add_watch_keyword(
            &req.keyword,
            req.category_hint.as_deref(),
            req.priority.unwrap_or(0).clamp(0, 2),
        )
        .await?;
    Ok(Json(json!({"id": id})))
}

pub async fn remove_watchlist(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    if ctx.tasks.remove_watch_keyword(id).await? {
        Ok(Json(json!({"removed": id})).into_response())
    } else {
        Ok(not_found("watch list item"))
    }
}

// ----------------------------------------------------------------------
// Analytics
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub category: Option<String>,
}

pub async fn search(
    State(ctx): State<AppContext>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let category = match query.category.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(ProductCategory::parse(raw).ok_or_else(|| {
            CrawlError::InvalidInput(format!("unknown category {raw:?}"))
        })?),
    };
    let drugs = ctx.analytics.search_drugs(&query.q, category).await?;
    let count = drugs.len();
    Ok(Json(json!({"drugs": drugs, "count": count})))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn list_drugs(
    State(ctx): State<AppContext>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = page.limit.unwrap_or(50).clamp(1, 200);
    let offset = page.offset.unwrap_or(0).max(0);
    let drugs = ctx.analytics.list_drugs_with_stats(limit, offset).await?;
    let count = drugs.len();
    Ok(Json(json!({"drugs": drugs, "count": count})))
}

#[derive(Debug, Deserialize)]
pub struct PricesQuery {
    #[serde(default)]
    pub include_outliers: Option<bool>,
    #[serde(default)]
    pub days: Option<i64>,
}

fn price_json(record: &PriceRecord) -> serde_json::Value {
    json!({
        "id": record.id,
        "price": format_price_yuan(record.price_cents),
        "price_cents": record.price_cents,
        "supplier_name": record.supplier_name,
        "supplier_id": record.supplier_id,
        "source_url": record.source_url,
        "crawled_at": record.crawled_at,
        "is_outlier": record.is_outlier,
        "outlier_reason": record.outlier_reason,
    })
}

pub async fn drug_prices(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
    Query(query): Query<PricesQuery>,
) -> ApiResult<Response> {
    if ctx.analytics.get_drug(id).await?.is_none() {
        return Ok(not_found("drug"));
    }
    let include_outliers = query.include_outliers.unwrap_or(true);
    let records = match query.days {
        Some(days) => ctx.analytics.price_history(id, days, include_outliers).await?,
        None => ctx.analytics.get_prices(id, include_outliers).await?,
    };
    let prices: Vec<serde_json::Value> = records.iter().map(price_json).collect();
    Ok(Json(json!({"drug_id": id, "prices": prices, "count": prices.len()})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub drug_id: i64,
    #[serde(default)]
    pub include_outliers: Option<bool>,
}

pub async fn compare(
    State(ctx): State<AppContext>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<Response> {
    let include_outliers = query.include_outliers.unwrap_or(false);
    match ctx
        .analytics
        .compare_drug(query.drug_id, include_outliers)
        .await?
    {
        None => Ok(not_found("drug")),
        Some(view) => {
            let suppliers: Vec<serde_json::Value> = view
                .suppliers
                .iter()
                .map(|s| {
                    json!({
                        "supplier_name": s.supplier_name,
                        "supplier_id": s.supplier_id,
                        "price": format_price_yuan(s.price_cents),
                        "crawled_at": s.crawled_at,
                    })
                })
                .collect();
            Ok(Json(json!({
                "drug": view.drug,
                "suppliers": suppliers,
                "lowest": view.lowest_cents.map(format_price_yuan),
                "highest": view.highest_cents.map(format_price_yuan),
                "diff_pct": view.diff_pct,
            }))
            .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub days: Option<i64>,
}

pub async fn alerts(
    State(ctx): State<AppContext>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let alerts = ctx.tasks.list_alerts(query.days.unwrap_or(7)).await?;
    let count = alerts.len();
    Ok(Json(json!({"alerts": alerts, "count": count})))
}

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub drug_id: i64,
    pub kind: String,
    #[serde(default)]
    pub threshold_pct: Option<f64>,
}

pub async fn create_rule(
    State(ctx): State<AppContext>,
    Json(req): Json<RuleRequest>,
) -> ApiResult<Response> {
    let kind = MonitorRuleKind::parse(&req.kind)
        .ok_or_else(|| CrawlError::InvalidInput(format!("unknown rule kind {:?}", req.kind)))?;
    if ctx.analytics.get_drug(req.drug_id).await?.is_none() {
        return Ok(not_found("drug"));
    }
    let id = ctx
        .tasks
        .create_rule(req.drug_id, kind, req.threshold_pct.unwrap_or(10.0))
        .await?;
    Ok(Json(json!({"id": id})).into_response())
}

pub async fn statistics(State(ctx): State<AppContext>) -> ApiResult<Json<serde_json::Value>> {
    let stats = ctx.analytics.statistics().await?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ----------------------------------------------------------------------
// Progress push channel
// ----------------------------------------------------------------------

/// SSE stream of scheduler progress events.
pub async fn event_stream(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = ctx.scheduler.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event("progress").data(payload));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("SSE consumer lagged, skipped {skipped} events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "message": format!("{what} not found")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status_of(err: CrawlError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn error_kinds_map_to_the_documented_statuses() {
        assert_eq!(
            status_of(CrawlError::InvalidInput("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(CrawlError::Auth), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(CrawlError::RateLimited {
                retry_after: Duration::from_secs(5)
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(CrawlError::upstream_client(502, "bad gateway")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(CrawlError::browser("gone")),
            StatusCode::BAD_GATEWAY
        );
    }
}
