//! Ingest pipeline: normalize, classify, persist, annotate.
//!
//! An `AcquisitionResult` fans out into drug identities; each identity is
//! persisted in its own transaction so one bad identity rolls back alone.
//! Aggregates never materialize drugs on their own; only offers do.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::acquisition::{AcquisitionResult, OfferHarvester};
use crate::application::monitor::{MonitorService, PriceSnapshot};
use crate::domain::classifier::classify;
use crate::domain::entities::Offer;
use crate::domain::normalizer::{identity_key, normalize_name, IdentityKey};
use crate::errors::{CrawlError, CrawlResult};
use crate::infrastructure::drug_repository::{DrugFields, DrugRepository};
use crate::infrastructure::price_repository::{PriceObservation, PriceRepository};

/// Per-keyword ingest outcome.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub drugs_touched: u64,
    pub prices_inserted: u64,
    pub rows_reannotated: u64,
    pub alerts_emitted: u64,
    pub dropped_offers: u64,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Run the browser detail extractor for weakly classified identities.
    pub extract_details: bool,
    /// At most this many detail extractions per batch.
    pub detail_cap: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            extract_details: false,
            detail_cap: 10,
        }
    }
}

/// Classification below this confidence is worth a detail-page look when
/// detail extraction is enabled.
const WEAK_CONFIDENCE: f64 = 0.85;

pub struct IngestService {
    drugs: DrugRepository,
    prices: PriceRepository,
    monitor: Arc<MonitorService>,
    harvester: Arc<dyn OfferHarvester>,
}

impl IngestService {
    pub fn new(
        drugs: DrugRepository,
        prices: PriceRepository,
        monitor: Arc<MonitorService>,
        harvester: Arc<dyn OfferHarvester>,
    ) -> Self {
        Self {
            drugs,
            prices,
            monitor,
            harvester,
        }
    }

    /// Persist an acquisition result. Offers that cannot be normalized are
    /// dropped with a warning; a persistence failure rolls back only the
    /// identity it happened in.
    pub async fn persist_result(
        &self,
        result: &AcquisitionResult,
        opts: &IngestOptions,
        cancel: &CancellationToken,
    ) -> CrawlResult<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut details_budget = if opts.extract_details { opts.detail_cap } else { 0 };

        for (identity, offers) in group_by_identity(&result.offers, &mut summary) {
            if cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }

            // Representative fields come from the most specific offer.
            let upstream_id = offers.iter().find_map(|o| o.upstream_drug_id);
            let raw_name = &offers[0].name;

            let mut classification =
                classify(&identity.name, &identity.manufacturer, None);
            let mut approval_number = None;

            if details_budget > 0 && classification.confidence < WEAK_CONFIDENCE {
                if let Some(drug_id) = upstream_id {
                    details_budget -= 1;
                    match self.harvester.extract_detail(drug_id, cancel).await {
                        Ok(signals) => {
                            if let Some(approval) = signals.approval_number {
                                classification = classify(
                                    &identity.name,
                                    &identity.manufacturer,
                                    Some(&approval),
                                );
                                approval_number = Some(approval);
                            }
                        }
                        Err(CrawlError::Cancelled) => return Err(CrawlError::Cancelled),
                        // Best-effort: a failed detail pass never fails ingest.
                        Err(err) => debug!("detail extraction skipped: {err}"),
                    }
                }
            }

            let fields = DrugFields {
                upstream_id,
                classification,
                approval_number,
            };
            let observations: Vec<PriceObservation> = offers
                .iter()
                .map(|offer| PriceObservation {
                    price_cents: offer.price_cents,
                    supplier_name: offer.supplier_name.clone(),
                    supplier_id: offer.supplier_id,
                    source_url: offer.source_url.clone(),
                    crawled_at: Utc::now(),
                })
                .collect();

            match self.persist_identity(&identity, &fields, &observations).await {
                Ok((drug_id, inserted, before)) => {
                    summary.drugs_touched += 1;
                    summary.prices_inserted += inserted;

                    // The raw listing name doubles as a search alias when
                    // cleanup actually changed it.
                    let raw = normalize_name(raw_name);
                    if raw != identity.name && !raw.is_empty() {
                        let _ = self.drugs.add_alias(drug_id, &raw).await;
                    }

                    summary.rows_reannotated += self.prices.annotate_drug(drug_id).await?;
                    summary.alerts_emitted +=
                        self.monitor.evaluate(drug_id, &before).await.unwrap_or(0);
                }
                Err(err) => {
                    warn!("identity {:?} rolled back: {err}", identity.name);
                }
            }
        }

        Ok(summary)
    }

    /// One transaction per identity: read-or-insert the drug, snapshot the
    /// pre-batch price state through the same transaction, append the
    /// batch, commit. The snapshot feeds monitor evaluation after commit.
    async fn persist_identity(
        &self,
        identity: &IdentityKey,
        fields: &DrugFields,
        observations: &[PriceObservation],
    ) -> CrawlResult<(i64, u64, PriceSnapshot)> {
        use sqlx::Row;

        let mut tx = self.drugs.pool().begin().await?;
        let drug_id = self.drugs.upsert_drug(&mut tx, identity, fields).await?;

        let mut before = PriceSnapshot::default();
        let rows = sqlx::query(
            "SELECT price_cents, supplier_name FROM price_records
             WHERE drug_id = ? AND is_outlier = 0",
        )
        .bind(drug_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in rows {
            let cents: i64 = row.get("price_cents");
            before.min_price_cents =
                Some(before.min_price_cents.map_or(cents, |m| m.min(cents)));
            before.suppliers.insert(row.get("supplier_name"));
        }

        let inserted = self.prices.append_prices(&mut tx, drug_id, observations).await?;
        tx.commit().await?;
        Ok((drug_id, inserted, before))
    }
}

/// Group offers by identity tuple, counting the ones that fail to
/// normalize. Order is kept deterministic by sorting on the key.
fn group_by_identity<'a>(
    offers: &'a [Offer],
    summary: &mut IngestSummary,
) -> Vec<(IdentityKey, Vec<&'a Offer>)> {
    let mut groups: HashMap<IdentityKey, Vec<&Offer>> = HashMap::new();
    for offer in offers {
        match identity_key(&offer.name, &offer.specification, &offer.manufacturer) {
            Ok(key) => groups.entry(key).or_default().push(offer),
            Err(err) => {
                warn!("dropping offer: {err}");
                summary.dropped_offers += 1;
            }
        }
    }
    let mut grouped: Vec<_> = groups.into_iter().collect();
    grouped.sort_by(|a, b| a.0.name.cmp(&b.0.name).then(a.0.specification.cmp(&b.0.specification)));
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::acquisition::AcquireMethod;
    use crate::domain::entities::{OfferProvenance, ProductCategory};
    use crate::infrastructure::browser_harvester::DetailSignals;
    use crate::infrastructure::database_connection::memory_pool;
    use crate::infrastructure::task_repository::TaskRepository;
    use async_trait::async_trait;

    struct NoopHarvester;

    #[async_trait]
    impl OfferHarvester for NoopHarvester {
        async fn harvest_offers(
            &self,
            _keyword: &str,
            _cancel: &CancellationToken,
        ) -> CrawlResult<Vec<Offer>> {
            Ok(vec![])
        }

        async fn extract_detail(
            &self,
            _upstream_drug_id: i64,
            _cancel: &CancellationToken,
        ) -> CrawlResult<DetailSignals> {
            Ok(DetailSignals::default())
        }
    }

    fn offer(name: &str, spec: &str, supplier: &str, price_cents: i64) -> Offer {
        Offer {
            name: name.to_string(),
            specification: spec.to_string(),
            manufacturer: String::new(),
            price_cents,
            supplier_name: supplier.to_string(),
            supplier_id: None,
            upstream_drug_id: None,
            wholesale_id: None,
            source_url: String::new(),
            provenance: OfferProvenance::Endpoint,
        }
    }

    fn result_with(offers: Vec<Offer>) -> AcquisitionResult {
        AcquisitionResult {
            method: AcquireMethod::Endpoint,
            offers,
            aggregates: vec![],
            endpoint_count: 0,
            browser_count: 0,
        }
    }

    async fn service() -> (IngestService, DrugRepository, PriceRepository) {
        let pool = memory_pool().await;
        let drugs = DrugRepository::new(pool.clone());
        let prices = PriceRepository::new(pool.clone());
        let tasks = TaskRepository::new(pool);
        let monitor = Arc::new(MonitorService::new(prices.clone(), tasks));
        let ingest = IngestService::new(
            drugs.clone(),
            prices.clone(),
            monitor,
            Arc::new(NoopHarvester),
        );
        (ingest, drugs, prices)
    }

    #[tokio::test]
    async fn mixed_categories_become_distinct_rows() {
        let (ingest, drugs, _) = service().await;
        let result = result_with(vec![
            offer("皇后牌 片仔癀 珍珠霜 25g", "25g", "甲", 3500),
            offer("片仔癀 3g*1粒(RX)", "3g*1粒", "乙", 65_000),
        ]);
        let summary = ingest
            .persist_result(&result, &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.drugs_touched, 2);
        assert_eq!(summary.prices_inserted, 2);

        let cream = drugs.search_drugs("珍珠霜", None, 10).await.unwrap();
        assert_eq!(cream.len(), 1);
        assert_eq!(cream[0].category, ProductCategory::Cosmetic);
        assert!(cream[0].category_confidence >= 0.90);

        let pill = drugs.search_drugs("3g*1粒", None, 10).await.unwrap();
        assert_eq!(pill.len(), 1);
        assert_eq!(pill[0].category, ProductCategory::Drug);
        assert_eq!(pill[0].category_confidence, 1.0);
    }

    #[tokio::test]
    async fn repeat_ingest_reuses_identities_and_appends_history() {
        let (ingest, drugs, prices) = service().await;
        let result = result_with(vec![offer("阿莫西林胶囊", "0.25g*24", "九州通", 1250)]);

        ingest
            .persist_result(&result, &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        ingest
            .persist_result(&result, &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(drugs.count_drugs().await.unwrap(), 1);
        assert_eq!(prices.count_prices().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn promo_decorated_names_collapse_and_leave_an_alias() {
        let (ingest, drugs, _) = service().await;
        let result = result_with(vec![
            offer("1盒包邮 片仔癀3g*1粒(RX)", "3g*1粒", "甲", 64_000),
            offer("片仔癀3g*1粒(RX)", "3g*1粒", "乙", 65_000),
        ]);
        let summary = ingest
            .persist_result(&result, &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.drugs_touched, 1);
        assert_eq!(summary.prices_inserted, 2);
    }

    #[tokio::test]
    async fn unnormalizable_offers_are_dropped_not_fatal() {
        let (ingest, drugs, _) = service().await;
        let result = result_with(vec![
            offer("!!!", "", "甲", 100),
            offer("正常商品片", "", "乙", 200),
        ]);
        let summary = ingest
            .persist_result(&result, &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.dropped_offers, 1);
        assert_eq!(summary.drugs_touched, 1);
        assert_eq!(drugs.count_drugs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outliers_are_annotated_after_persist() {
        let (ingest, drugs, prices) = service().await;
        let offers = vec![
            offer("某药片", "1g", "a", 65_000),
            offer("某药片", "1g", "b", 65_000),
            offer("某药片", "1g", "c", 66_000),
            offer("某药片", "1g", "d", 83_000),
            offer("某药片", "1g", "e", 999_900),
        ];
        ingest
            .persist_result(&result_with(offers), &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let drug = drugs.search_drugs("某药片", None, 10).await.unwrap();
        let rows = prices.get_prices(drug[0].id, true).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| [-1, 0, 1, 2].contains(&r.is_outlier)));
        assert_eq!(rows.iter().filter(|r| r.is_outlier == 2).count(), 1);
    }

    #[tokio::test]
    async fn aggregates_alone_create_no_drugs() {
        let (ingest, drugs, _) = service().await;
        let mut result = result_with(vec![]);
        result.aggregates = vec![crate::domain::entities::DrugAggregate {
            name: "孤儿聚合行".into(),
            specification: String::new(),
            manufacturer: String::new(),
            upstream_id: Some(9),
            min_price_cents: 100,
            max_price_cents: 200,
            supplier_count: 4,
        }];
        let summary = ingest
            .persist_result(&result, &IngestOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.drugs_touched, 0);
        assert_eq!(drugs.count_drugs().await.unwrap(), 0);
    }
}
