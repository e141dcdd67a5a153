//! The hybrid acquisition strategy: endpoint-first, browser-fallback.
//!
//! The endpoint pass is cheap and covers common keywords; the browser pass
//! is expensive but sees the full rendered offer list. The orchestrator only
//! pays for the browser when the endpoint pass is insufficient, then merges
//! and dedups the two result sets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::entities::{DrugAggregate, Offer, OfferProvenance, Supplier};
use crate::domain::normalizer::{name_matches_keyword, normalize_manufacturer, normalize_name, normalize_specification};
use crate::errors::{CrawlError, CrawlResult};
use crate::infrastructure::browser_harvester::{BrowserHarvester, DetailSignals};
use crate::infrastructure::upstream_client::UpstreamClient;

/// Seam over the upstream JSON endpoints (C2), stubbed in tests.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    async fn search_aggregate(
        &self,
        keyword: &str,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<DrugAggregate>>;

    async fn facet_suppliers(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Supplier>>;

    async fn supplier_hot_list(
        &self,
        supplier: &Supplier,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>>;
}

/// Seam over the browser harvester (C3).
#[async_trait]
pub trait OfferHarvester: Send + Sync {
    async fn harvest_offers(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>>;

    async fn extract_detail(
        &self,
        upstream_drug_id: i64,
        cancel: &CancellationToken,
    ) -> CrawlResult<DetailSignals>;
}

#[async_trait]
impl AggregateSource for UpstreamClient {
    async fn search_aggregate(
        &self,
        keyword: &str,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<DrugAggregate>> {
        UpstreamClient::search_aggregate(self, keyword, page, page_size, cancel).await
    }

    async fn facet_suppliers(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Supplier>> {
        UpstreamClient::facet_suppliers(self, keyword, cancel).await
    }

    async fn supplier_hot_list(
        &self,
        supplier: &Supplier,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>> {
        UpstreamClient::supplier_hot_list(self, supplier, page, page_size, cancel).await
    }
}

#[async_trait]
impl OfferHarvester for BrowserHarvester {
    async fn harvest_offers(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>> {
        BrowserHarvester::harvest_offers(self, keyword, cancel).await
    }

    async fn extract_detail(
        &self,
        upstream_drug_id: i64,
        cancel: &CancellationToken,
    ) -> CrawlResult<DetailSignals> {
        BrowserHarvester::extract_detail(self, upstream_drug_id, cancel).await
    }
}

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// How many facet suppliers to walk (of up to ~1000).
    pub supplier_cap: usize,
    /// Concurrent hot-list calls.
    pub api_concurrency: usize,
    /// Sufficiency threshold for skipping the browser pass.
    pub min_providers: usize,
    /// Always run the browser pass.
    pub force_browser: bool,
    /// Skip the browser pass even when insufficient (endpoint-only mode).
    pub endpoint_only: bool,
    /// Aggregate search pages to walk (100 rows each).
    pub max_pages: u32,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            supplier_cap: 100,
            api_concurrency: 8,
            min_providers: 5,
            force_browser: false,
            endpoint_only: false,
            max_pages: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMethod {
    Endpoint,
    Browser,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    pub method: AcquireMethod,
    pub offers: Vec<Offer>,
    pub aggregates: Vec<DrugAggregate>,
    pub endpoint_count: usize,
    pub browser_count: usize,
}

pub struct AcquisitionOrchestrator {
    source: Arc<dyn AggregateSource>,
    harvester: Arc<dyn OfferHarvester>,
}

impl AcquisitionOrchestrator {
    pub fn new(source: Arc<dyn AggregateSource>, harvester: Arc<dyn OfferHarvester>) -> Self {
        Self { source, harvester }
    }

    /// Acquire all supplier offers for one keyword.
    pub async fn acquire_suppliers_for_keyword(
        &self,
        keyword: &str,
        opts: &AcquireOptions,
        cancel: &CancellationToken,
    ) -> CrawlResult<AcquisitionResult> {
        if keyword.trim().is_empty() {
            return Err(CrawlError::InvalidInput("keyword must not be empty".into()));
        }

        // Endpoint pass. Short pages end the aggregate walk early.
        let mut aggregates = Vec::new();
        for page in 1..=opts.max_pages.max(1) {
            let batch = self.source.search_aggregate(keyword, page, 100, cancel).await?;
            let got = batch.len();
            aggregates.extend(
                batch
                    .into_iter()
                    .filter(|agg| name_matches_keyword(&agg.name, keyword)),
            );
            if got < 100 {
                break;
            }
        }

        let suppliers = self.source.facet_suppliers(keyword, cancel).await?;
        let endpoint_offers = self
            .hot_list_pass(keyword, &suppliers, opts, cancel)
            .await?;
        let endpoint_count = endpoint_offers.len();
        info!(
            "[{keyword}] endpoint pass: {} aggregates, {} suppliers, {} offers",
            aggregates.len(),
            suppliers.len(),
            endpoint_count
        );

        if cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }

        // Sufficiency check.
        let sufficient = endpoint_count >= opts.min_providers;
        let upstream_is_empty = aggregates.is_empty() && suppliers.is_empty();
        if (sufficient || opts.endpoint_only || upstream_is_empty) && !opts.force_browser {
            return Ok(AcquisitionResult {
                method: AcquireMethod::Endpoint,
                offers: merge_offers(endpoint_offers, vec![]),
                aggregates,
                endpoint_count,
                browser_count: 0,
            });
        }

        // Browser pass. A harvest failure degrades to the endpoint result
        // rather than failing the keyword.
        let browser_offers = match self.harvester.harvest_offers(keyword, cancel).await {
            Ok(offers) => offers
                .into_iter()
                .filter(|o| name_matches_keyword(&o.name, keyword))
                .collect::<Vec<_>>(),
            Err(CrawlError::Cancelled) => return Err(CrawlError::Cancelled),
            Err(err) => {
                warn!("[{keyword}] browser pass failed, keeping endpoint data: {err}");
                return Ok(AcquisitionResult {
                    method: AcquireMethod::Endpoint,
                    offers: merge_offers(endpoint_offers, vec![]),
                    aggregates,
                    endpoint_count,
                    browser_count: 0,
                });
            }
        };
        let browser_count = browser_offers.len();

        let method = match (endpoint_count, browser_count) {
            (0, _) => AcquireMethod::Browser,
            (_, 0) => AcquireMethod::Endpoint,
            _ => AcquireMethod::Hybrid,
        };

        Ok(AcquisitionResult {
            method,
            offers: merge_offers(endpoint_offers, browser_offers),
            aggregates,
            endpoint_count,
            browser_count,
        })
    }

    /// Walk supplier hot lists with bounded concurrency, keeping offers that
    /// match the keyword. Individual supplier failures are logged and
    /// skipped; auth failure and cancellation abort the pass.
    async fn hot_list_pass(
        &self,
        keyword: &str,
        suppliers: &[Supplier],
        opts: &AcquireOptions,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>> {
        let selected: Vec<&Supplier> = suppliers
            .iter()
            .filter(|s| s.id.is_some())
            .take(opts.supplier_cap)
            .collect();

        let mut pending: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = CrawlResult<Vec<Offer>>> + Send + '_>>> =
            Vec::with_capacity(selected.len());
        for supplier in selected {
            let source = Arc::clone(&self.source);
            pending.push(Box::pin(async move {
                source
                    .supplier_hot_list(supplier, 1, 200, cancel)
                    .await
                    .map(|offers| {
                        offers
                            .into_iter()
                            .filter(|o| name_matches_keyword(&o.name, keyword))
                            .collect::<Vec<_>>()
                    })
            }));
        }

        let results: Vec<CrawlResult<Vec<Offer>>> = stream::iter(pending)
            .buffer_unordered(opts.api_concurrency.max(1))
            .collect()
            .await;

        let mut offers = Vec::new();
        for result in results {
            match result {
                Ok(mut batch) => offers.append(&mut batch),
                Err(err @ (CrawlError::Auth | CrawlError::Cancelled)) => return Err(err),
                Err(err) => warn!("[{keyword}] supplier hot list failed: {err}"),
            }
        }
        Ok(offers)
    }
}

/// Merge identity key for dedup across passes.
fn merge_key(offer: &Offer) -> (String, String, String, String, i64) {
    let supplier = match offer.supplier_id {
        Some(id) => format!("#{id}"),
        None => offer.supplier_name.clone(),
    };
    (
        normalize_name(&offer.name),
        normalize_specification(&offer.specification),
        normalize_manufacturer(&offer.manufacturer),
        supplier,
        offer.price_cents,
    )
}

/// How many identifying fields the record actually carries.
fn specificity(offer: &Offer) -> usize {
    offer.supplier_id.is_some() as usize
        + offer.upstream_drug_id.is_some() as usize
        + offer.wholesale_id.is_some() as usize
        + !offer.specification.is_empty() as usize
        + !offer.manufacturer.is_empty() as usize
}

/// Deduplicate endpoint and browser offers on the merge key. The record
/// carrying more specific fields wins; endpoint provenance wins exact ties.
fn merge_offers(endpoint: Vec<Offer>, browser: Vec<Offer>) -> Vec<Offer> {
    let mut merged: HashMap<(String, String, String, String, i64), Offer> = HashMap::new();

    for offer in endpoint.into_iter().chain(browser.into_iter()) {
        let key = merge_key(&offer);
        match merged.get(&key) {
            None => {
                merged.insert(key, offer);
            }
            Some(existing) => {
                let take_new = specificity(&offer) > specificity(existing)
                    || (specificity(&offer) == specificity(existing)
                        && existing.provenance == OfferProvenance::Browser
                        && offer.provenance == OfferProvenance::Endpoint);
                if take_new {
                    merged.insert(key, offer);
                }
            }
        }
    }

    let mut offers: Vec<Offer> = merged.into_values().collect();
    // Deterministic output order regardless of hot-list completion order.
    offers.sort_by(|a, b| {
        (&a.name, &a.supplier_name, a.price_cents).cmp(&(&b.name, &b.supplier_name, b.price_cents))
    });
    offers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn offer(name: &str, supplier: &str, price_cents: i64, provenance: OfferProvenance) -> Offer {
        Offer {
            name: name.to_string(),
            specification: String::new(),
            manufacturer: String::new(),
            price_cents,
            supplier_name: supplier.to_string(),
            supplier_id: None,
            upstream_drug_id: None,
            wholesale_id: None,
            source_url: String::new(),
            provenance,
        }
    }

    fn aggregate(name: &str) -> DrugAggregate {
        DrugAggregate {
            name: name.to_string(),
            specification: String::new(),
            manufacturer: String::new(),
            upstream_id: Some(1),
            min_price_cents: 1000,
            max_price_cents: 2000,
            supplier_count: 3,
        }
    }

    /// Endpoint stub: N suppliers, each hot list carrying a share of the
    /// configured offers.
    struct StubSource {
        aggregates: Vec<DrugAggregate>,
        offers_per_supplier: Vec<Vec<Offer>>,
        hot_list_calls: AtomicUsize,
    }

    #[async_trait]
    impl AggregateSource for StubSource {
        async fn search_aggregate(
            &self,
            _keyword: &str,
            _page: u32,
            _page_size: u32,
            _cancel: &CancellationToken,
        ) -> CrawlResult<Vec<DrugAggregate>> {
            Ok(self.aggregates.clone())
        }

        async fn facet_suppliers(
            &self,
            _keyword: &str,
            _cancel: &CancellationToken,
        ) -> CrawlResult<Vec<Supplier>> {
            Ok((0..self.offers_per_supplier.len())
                .map(|i| Supplier {
                    id: Some(i as i64 + 1),
                    name: format!("供应商{i}"),
                })
                .collect())
        }

        async fn supplier_hot_list(
            &self,
            supplier: &Supplier,
            _page: u32,
            _page_size: u32,
            _cancel: &CancellationToken,
        ) -> CrawlResult<Vec<Offer>> {
            self.hot_list_calls.fetch_add(1, Ordering::SeqCst);
            let idx = (supplier.id.unwrap() - 1) as usize;
            let mut offers = self.offers_per_supplier[idx].clone();
            for o in &mut offers {
                o.supplier_id = supplier.id;
                o.supplier_name = supplier.name.clone();
            }
            Ok(offers)
        }
    }

    struct StubHarvester {
        offers: CrawlResult<Vec<Offer>>,
        calls: AtomicUsize,
    }

    impl StubHarvester {
        fn returning(offers: Vec<Offer>) -> Self {
            Self {
                offers: Ok(offers),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                offers: Err(CrawlError::browser("layout changed")),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OfferHarvester for StubHarvester {
        async fn harvest_offers(
            &self,
            _keyword: &str,
            _cancel: &CancellationToken,
        ) -> CrawlResult<Vec<Offer>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.offers {
                Ok(offers) => Ok(offers.clone()),
                Err(_) => Err(CrawlError::browser("layout changed")),
            }
        }

        async fn extract_detail(
            &self,
            _upstream_drug_id: i64,
            _cancel: &CancellationToken,
        ) -> CrawlResult<DetailSignals> {
            Ok(DetailSignals::default())
        }
    }

    fn endpoint_offers(keyword: &str, count: usize) -> Vec<Vec<Offer>> {
        // One matching offer per supplier.
        (0..count)
            .map(|i| {
                vec![offer(
                    &format!("{keyword}胶囊 0.25g"),
                    "placeholder",
                    1000 + i as i64,
                    OfferProvenance::Endpoint,
                )]
            })
            .collect()
    }

    #[tokio::test]
    async fn common_keyword_endpoint_sufficient_skips_browser() {
        let source = Arc::new(StubSource {
            aggregates: vec![aggregate("阿莫西林胶囊")],
            offers_per_supplier: endpoint_offers("阿莫西林", 12),
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::returning(vec![]));
        let orchestrator =
            AcquisitionOrchestrator::new(source.clone(), harvester.clone());

        let result = orchestrator
            .acquire_suppliers_for_keyword("阿莫西林", &AcquireOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, AcquireMethod::Endpoint);
        assert_eq!(result.offers.len(), 12);
        assert_eq!(result.endpoint_count, 12);
        assert_eq!(result.browser_count, 0);
        assert_eq!(harvester.calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.hot_list_calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn sparse_keyword_falls_back_to_hybrid() {
        let source = Arc::new(StubSource {
            aggregates: vec![aggregate("天麻蜜环菌片")],
            offers_per_supplier: endpoint_offers("天麻蜜环菌片", 2),
            hot_list_calls: AtomicUsize::new(0),
        });
        let browser_offers: Vec<Offer> = (0..66)
            .map(|i| {
                offer(
                    "天麻蜜环菌片 0.25g*100片",
                    &format!("药店{i}"),
                    2000 + i,
                    OfferProvenance::Browser,
                )
            })
            .collect();
        let harvester = Arc::new(StubHarvester::returning(browser_offers));
        let orchestrator = AcquisitionOrchestrator::new(source, harvester.clone());

        let result = orchestrator
            .acquire_suppliers_for_keyword("天麻蜜环菌片", &AcquireOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, AcquireMethod::Hybrid);
        assert_eq!(harvester.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.endpoint_count, 2);
        assert_eq!(result.browser_count, 66);
        assert!(result.offers.len() <= 68);
        assert!(result.offers.len() >= 66);
    }

    #[tokio::test]
    async fn exactly_min_providers_skips_the_browser() {
        let source = Arc::new(StubSource {
            aggregates: vec![aggregate("布洛芬")],
            offers_per_supplier: endpoint_offers("布洛芬", 5),
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::returning(vec![offer(
            "布洛芬",
            "x",
            1,
            OfferProvenance::Browser,
        )]));
        let orchestrator = AcquisitionOrchestrator::new(source, harvester.clone());

        let result = orchestrator
            .acquire_suppliers_for_keyword("布洛芬", &AcquireOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, AcquireMethod::Endpoint);
        assert_eq!(harvester.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn browser_failure_degrades_to_endpoint_result() {
        let source = Arc::new(StubSource {
            aggregates: vec![aggregate("天麻蜜环菌片")],
            offers_per_supplier: endpoint_offers("天麻蜜环菌片", 2),
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::failing());
        let orchestrator = AcquisitionOrchestrator::new(source, harvester);

        let result = orchestrator
            .acquire_suppliers_for_keyword("天麻蜜环菌片", &AcquireOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, AcquireMethod::Endpoint);
        assert_eq!(result.offers.len(), 2);
        assert_eq!(result.browser_count, 0);
    }

    #[tokio::test]
    async fn force_browser_runs_the_pass_even_when_sufficient() {
        let source = Arc::new(StubSource {
            aggregates: vec![aggregate("阿莫西林")],
            offers_per_supplier: endpoint_offers("阿莫西林", 8),
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::returning(vec![offer(
            "阿莫西林分散片",
            "新药店",
            1234,
            OfferProvenance::Browser,
        )]));
        let orchestrator = AcquisitionOrchestrator::new(source, harvester.clone());

        let opts = AcquireOptions {
            force_browser: true,
            ..Default::default()
        };
        let result = orchestrator
            .acquire_suppliers_for_keyword("阿莫西林", &opts, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, AcquireMethod::Hybrid);
        assert_eq!(harvester.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_upstream_succeeds_with_empty_result() {
        let source = Arc::new(StubSource {
            aggregates: vec![],
            offers_per_supplier: vec![],
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::returning(vec![]));
        let orchestrator = AcquisitionOrchestrator::new(source, harvester.clone());

        let result = orchestrator
            .acquire_suppliers_for_keyword("不存在的药", &AcquireOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, AcquireMethod::Endpoint);
        assert!(result.offers.is_empty());
        assert!(result.aggregates.is_empty());
        // No browser launch for a keyword the upstream knows nothing about.
        assert_eq!(harvester.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_keyword_is_invalid_input() {
        let source = Arc::new(StubSource {
            aggregates: vec![],
            offers_per_supplier: vec![],
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::returning(vec![]));
        let orchestrator = AcquisitionOrchestrator::new(source, harvester);
        let err = orchestrator
            .acquire_suppliers_for_keyword("  ", &AcquireOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidInput(_)));
    }

    #[test]
    fn merge_prefers_endpoint_on_identical_content() {
        let e = offer("阿莫西林胶囊", "九州通", 1250, OfferProvenance::Endpoint);
        let b = offer("阿莫西林胶囊", "九州通", 1250, OfferProvenance::Browser);
        let merged = merge_offers(vec![e], vec![b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].provenance, OfferProvenance::Endpoint);
    }

    #[test]
    fn merge_prefers_the_more_specific_record() {
        let mut specific = offer("阿莫西林胶囊", "九州通", 1250, OfferProvenance::Browser);
        specific.manufacturer = "华北制药".into();
        specific.specification = "0.25g*24".into();
        let vague = offer("阿莫西林胶囊", "九州通", 1250, OfferProvenance::Endpoint);
        // Different merge keys (spec/manufacturer differ), so both survive;
        // name-only duplicates collapse.
        let merged = merge_offers(vec![vague.clone()], vec![specific]);
        assert_eq!(merged.len(), 2);

        let mut enriched = vague.clone();
        enriched.wholesale_id = Some(7);
        let merged = merge_offers(vec![vague], vec![enriched]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].wholesale_id, Some(7));
    }

    #[test]
    fn merge_treats_name_only_suppliers_as_distinct() {
        let a = offer("同一个药", "供应商甲", 1000, OfferProvenance::Browser);
        let b = offer("同一个药", "供应商乙", 1000, OfferProvenance::Browser);
        assert_eq!(merge_offers(vec![], vec![a, b]).len(), 2);
    }

    #[tokio::test]
    async fn cancellation_propagates() {
        let source = Arc::new(StubSource {
            aggregates: vec![aggregate("阿莫西林")],
            offers_per_supplier: endpoint_offers("阿莫西林", 3),
            hot_list_calls: AtomicUsize::new(0),
        });
        let harvester = Arc::new(StubHarvester::returning(vec![]));
        let orchestrator = AcquisitionOrchestrator::new(source, harvester);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator
            .acquire_suppliers_for_keyword("阿莫西林", &AcquireOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Cancelled));
    }
}
