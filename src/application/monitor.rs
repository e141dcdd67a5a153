//! Monitor rule evaluation over freshly ingested price rows.
//!
//! Evaluation is snapshot-based: the ingest pipeline captures the drug's
//! pre-batch state, persists and annotates the batch, then hands both
//! snapshots here. Alerts are immutable once created.

use std::collections::HashSet;

use tracing::info;

use crate::domain::entities::MonitorRuleKind;
use crate::domain::normalizer::format_price_yuan;
use crate::errors::CrawlResult;
use crate::infrastructure::price_repository::PriceRepository;
use crate::infrastructure::task_repository::TaskRepository;

/// A drug's observable price state at one instant, outlier rows excluded.
#[derive(Debug, Clone, Default)]
pub struct PriceSnapshot {
    pub min_price_cents: Option<i64>,
    pub suppliers: HashSet<String>,
}

pub struct MonitorService {
    prices: PriceRepository,
    tasks: TaskRepository,
}

impl MonitorService {
    pub fn new(prices: PriceRepository, tasks: TaskRepository) -> Self {
        Self { prices, tasks }
    }

    pub async fn snapshot(&self, drug_id: i64) -> CrawlResult<PriceSnapshot> {
        let rows = self.prices.get_prices(drug_id, false).await?;
        Ok(PriceSnapshot {
            min_price_cents: rows.iter().map(|r| r.price_cents).min(),
            suppliers: rows.into_iter().map(|r| r.supplier_name).collect(),
        })
    }

    /// Evaluate every enabled rule for the drug against the before/after
    /// pair. Returns the number of alerts emitted.
    pub async fn evaluate(
        &self,
        drug_id: i64,
        before: &PriceSnapshot,
    ) -> CrawlResult<u64> {
        let rules = self.tasks.rules_for_drug(drug_id).await?;
        if rules.is_empty() {
            return Ok(0);
        }
        let after = self.snapshot(drug_id).await?;

        let mut emitted = 0u64;
        for rule in rules {
            match rule.kind {
                MonitorRuleKind::PriceDrop | MonitorRuleKind::PriceRise => {
                    let (Some(old), Some(new)) = (before.min_price_cents, after.min_price_cents)
                    else {
                        continue;
                    };
                    if old <= 0 || old == new {
                        continue;
                    }
                    let change_pct = (new - old) as f64 / old as f64 * 100.0;
                    let fired = match rule.kind {
                        MonitorRuleKind::PriceDrop => -change_pct >= rule.threshold_pct,
                        MonitorRuleKind::PriceRise => change_pct >= rule.threshold_pct,
                        MonitorRuleKind::NewSupplier => false,
                    };
                    if !fired {
                        continue;
                    }
                    let message = format!(
                        "最低价 {} → {} ({change_pct:+.1}%)",
                        format_price_yuan(old),
                        format_price_yuan(new)
                    );
                    info!("alert for drug {drug_id}: {message}");
                    self.tasks
                        .insert_alert(drug_id, rule.kind, &message, Some(old), Some(new), Some(change_pct))
                        .await?;
                    emitted += 1;
                }
                MonitorRuleKind::NewSupplier => {
                    for supplier in after.suppliers.difference(&before.suppliers) {
                        let message = format!("新供应商: {supplier}");
                        info!("alert for drug {drug_id}: {message}");
                        self.tasks
                            .insert_alert(
                                drug_id,
                                rule.kind,
                                &message,
                                None,
                                after.min_price_cents,
                                None,
                            )
                            .await?;
                        emitted += 1;
                    }
                }
            }
        }
        Ok(emitted)
    }
}
