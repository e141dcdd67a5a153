//! Typed wrappers over the known upstream JSON endpoints.
//!
//! Three calls exist: aggregate search (min/max prices, no suppliers),
//! supplier facets (suppliers, no prices), and per-supplier hot lists (the
//! only endpoint that returns real per-supplier prices). Every payload is
//! wrapped in a `{code, message, data}` envelope; token expiry is signalled
//! in-band with its own code rather than an HTTP status.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::entities::{DrugAggregate, Offer, OfferProvenance, Supplier};
use crate::domain::normalizer::parse_price_cents;
use crate::errors::{CrawlError, CrawlResult};
use crate::infrastructure::credential_broker::CredentialBroker;
use crate::infrastructure::http_client::HttpClient;

const SEARCH_AGGREGATE_PATH: &str = "/wholesale-drug/sales/getRegularSearchPurchaseListForPc/v5430";
const FACET_SUPPLIERS_PATH: &str = "/wholesale-drug/sales/facetWholesaleListByProvider/v4270";
const SUPPLIER_HOT_LIST_PATH: &str = "/wholesale-drug/sales/getHotWholesalesForProvider/v4230";

/// Upstream code that means the session token is no longer accepted.
const CODE_TOKEN_EXPIRED: &str = "40020";

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct Envelope {
    code: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn code_str(&self) -> String {
        match &self.code {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }

    fn is_success(&self) -> bool {
        // "40001" is the upstream's quirky success-with-message code.
        matches!(self.code_str().as_str(), "0" | "40001")
    }

    fn is_token_expired(&self) -> bool {
        self.code_str() == CODE_TOKEN_EXPIRED
            || self
                .message
                .as_deref()
                .map(|m| m.contains("登录"))
                .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct AggregateRow {
    #[serde(default, rename = "drug")]
    drug: Option<Box<AggregateRow>>,
    #[serde(default, rename = "drugName")]
    drug_name: Option<String>,
    #[serde(default)]
    specification: Option<String>,
    #[serde(default)]
    factory: Option<String>,
    #[serde(default, rename = "drugId")]
    drug_id: Option<i64>,
    #[serde(default)]
    minprice: Option<Value>,
    #[serde(default)]
    maxprice: Option<Value>,
    #[serde(default, rename = "wholesaleNum")]
    wholesale_num: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProviderRow {
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    abbreviation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HotOfferRow {
    #[serde(default)]
    drugname: Option<String>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    specification: Option<String>,
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    wholesaleid: Option<i64>,
    #[serde(default, rename = "drugId")]
    drug_id: Option<i64>,
}

fn value_price_cents(value: &Option<Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => {
            let yuan = n.as_f64()?;
            Some((yuan * 100.0).round() as i64)
        }
        Some(Value::String(s)) => parse_price_cents(s),
        _ => None,
    }
}

pub struct UpstreamClient {
    http: Arc<HttpClient>,
    broker: Arc<CredentialBroker>,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(http: Arc<HttpClient>, broker: Arc<CredentialBroker>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            broker,
            base_url: base_url.into(),
        }
    }

    /// Aggregate search rows for a keyword: min/max price and supplier
    /// count, no per-supplier prices.
    pub async fn search_aggregate(
        &self,
        keyword: &str,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<DrugAggregate>> {
        validate_query(keyword, page, page_size)?;
        let body = json!({"keyword": keyword, "page": page, "pageSize": page_size});
        let data = self.call(SEARCH_AGGREGATE_PATH, &body, cancel).await?;

        let rows: Vec<AggregateRow> = unwrap_list(data)?;
        let aggregates = rows
            .into_iter()
            .filter_map(|row| {
                // Some responses nest the payload under a "drug" key.
                let row = match row.drug {
                    Some(inner) => *inner,
                    None => row,
                };
                let name = row.drug_name.unwrap_or_default();
                let min = value_price_cents(&row.minprice)?;
                if name.is_empty() {
                    return None;
                }
                Some(DrugAggregate {
                    name,
                    specification: row.specification.unwrap_or_default(),
                    manufacturer: row.factory.unwrap_or_default(),
                    upstream_id: row.drug_id,
                    min_price_cents: min,
                    max_price_cents: value_price_cents(&row.maxprice).unwrap_or(min),
                    supplier_count: row.wholesale_num.unwrap_or(1),
                })
            })
            .collect();
        Ok(aggregates)
    }

    /// The supplier facet for a keyword. Up to ~1000 rows; never any prices.
    pub async fn facet_suppliers(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Supplier>> {
        if keyword.trim().is_empty() {
            return Err(CrawlError::InvalidInput("keyword must not be empty".into()));
        }
        let body = json!({"keyword": keyword, "page": 1, "pageSize": 1000});
        let data = self.call(FACET_SUPPLIERS_PATH, &body, cancel).await?;

        let providers = data
            .get("providers")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        let rows: Vec<ProviderRow> = serde_json::from_value(providers)
            .map_err(|e| CrawlError::UpstreamProtocol {
                code: "shape".into(),
                message: format!("provider facet: {e}"),
            })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name = row.abbreviation.or(row.name).unwrap_or_default();
                if name.is_empty() && row.pid.is_none() {
                    return None;
                }
                Some(Supplier { id: row.pid, name })
            })
            .collect())
    }

    /// A supplier's hot offers, with prices. These are the supplier's top
    /// sellers, not their full catalogue; the caller filters by keyword.
    pub async fn supplier_hot_list(
        &self,
        supplier: &Supplier,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>> {
        if page == 0 || !(1..=200).contains(&page_size) {
            return Err(CrawlError::InvalidInput(format!(
                "page {page} / pageSize {page_size} out of range"
            )));
        }
        let provider_id = supplier
            .id
            .ok_or_else(|| CrawlError::InvalidInput("supplier without id".into()))?;
        let body = json!({"providerId": provider_id, "page": page, "pageSize": page_size});
        let data = self.call(SUPPLIER_HOT_LIST_PATH, &body, cancel).await?;

        let rows: Vec<HotOfferRow> = unwrap_list(data)?;
        let base = &self.base_url;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name = row.drugname.unwrap_or_default();
                let price_cents = value_price_cents(&row.price)?;
                if name.is_empty() {
                    return None;
                }
                let source_url = match (row.drug_id, row.wholesaleid) {
                    (Some(id), _) => format!("{base}/#/drug/{id}"),
                    (None, Some(wid)) => format!("{base}/#/wholesale/{wid}"),
                    (None, None) => format!("{base}/"),
                };
                Some(Offer {
                    name,
                    specification: row.specification.unwrap_or_default(),
                    manufacturer: row.manufacturer.unwrap_or_default(),
                    price_cents,
                    supplier_name: supplier.name.clone(),
                    supplier_id: supplier.id,
                    upstream_drug_id: row.drug_id,
                    wholesale_id: row.wholesaleid,
                    source_url,
                    provenance: OfferProvenance::Endpoint,
                })
            })
            .collect())
    }

    /// One envelope-unwrapped call with retry and a single reauthentication.
    async fn call(&self, path: &str, body: &Value, cancel: &CancellationToken) -> CrawlResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut reauthenticated = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let token = self.broker.get(cancel).await?;

            let outcome = self.once(&url, body, &token.token, cancel).await;
            match outcome {
                Ok(envelope) => {
                    if envelope.is_token_expired() {
                        if reauthenticated {
                            return Err(CrawlError::Auth);
                        }
                        warn!("upstream reports expired token, refreshing once");
                        self.broker.invalidate().await;
                        reauthenticated = true;
                        continue;
                    }
                    if !envelope.is_success() {
                        return Err(CrawlError::UpstreamProtocol {
                            code: envelope.code_str(),
                            message: envelope.message.unwrap_or_default(),
                        });
                    }
                    return Ok(envelope.data);
                }
                Err(CrawlError::Auth) => {
                    if reauthenticated {
                        return Err(CrawlError::Auth);
                    }
                    self.broker.invalidate().await;
                    reauthenticated = true;
                    continue;
                }
                Err(err) if err.is_recoverable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt, err.retry_after());
                    debug!("attempt {attempt} failed ({err}), retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn once(
        &self,
        url: &str,
        body: &Value,
        token: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Envelope> {
        let response = self.http.post_json(url, body, Some(token), cancel).await?;
        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CrawlError::Auth);
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5));
            return Err(CrawlError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(CrawlError::upstream_client(status.as_u16(), &body_text));
        }

        response
            .json::<Envelope>()
            .await
            .map_err(|e| CrawlError::upstream_client(0, &e.to_string()))
    }
}

/// 1s/2s/4s exponential backoff with ±250 ms jitter; an upstream-provided
/// retry-after always wins.
fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(after) = retry_after {
        return after;
    }
    let base_ms = 1000u64 << (attempt - 1).min(4);
    let jitter: i64 = rand::thread_rng().gen_range(-250..=250);
    Duration::from_millis(base_ms.saturating_add_signed(jitter))
}

fn validate_query(keyword: &str, page: u32, page_size: u32) -> CrawlResult<()> {
    if keyword.trim().is_empty() {
        return Err(CrawlError::InvalidInput("keyword must not be empty".into()));
    }
    if page == 0 {
        return Err(CrawlError::InvalidInput("page must be at least 1".into()));
    }
    if !(1..=200).contains(&page_size) {
        return Err(CrawlError::InvalidInput(format!(
            "pageSize {page_size} out of [1, 200]"
        )));
    }
    Ok(())
}

/// The upstream alternates between a bare list and `{"list": [...]}`.
fn unwrap_list<T: serde::de::DeserializeOwned>(data: Value) -> CrawlResult<Vec<T>> {
    let list = match data {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map.remove("list").unwrap_or(Value::Array(vec![])),
        Value::Null => Value::Array(vec![]),
        other => other,
    };
    serde_json::from_value(list).map_err(|e| CrawlError::UpstreamProtocol {
        code: "shape".into(),
        message: format!("unexpected payload shape: {e}"),
    })
}
