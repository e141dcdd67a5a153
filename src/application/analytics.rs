//! Read-only analytics over the stored price corpus: search, comparison,
//! history, and procurement recommendations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::entities::{Drug, PriceRecord, ProductCategory, TaskStatus};
use crate::errors::{CrawlError, CrawlResult};
use crate::infrastructure::drug_repository::DrugRepository;
use crate::infrastructure::price_repository::PriceRepository;
use crate::infrastructure::task_repository::TaskRepository;

/// One supplier's latest offer in a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct SupplierPrice {
    pub supplier_name: String,
    pub supplier_id: Option<i64>,
    pub price_cents: i64,
    pub crawled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonView {
    pub drug: Drug,
    /// Ascending by price; ties broken by the more recent observation.
    pub suppliers: Vec<SupplierPrice>,
    pub lowest_cents: Option<i64>,
    pub highest_cents: Option<i64>,
    /// (highest − lowest) / lowest × 100, when lowest > 0.
    pub diff_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub supplier_name: String,
    pub price_cents: i64,
    pub quantity: u64,
    pub subtotal_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub drug_id: i64,
    pub requested_quantity: u64,
    pub allocations: Vec<Allocation>,
    pub fulfilled_quantity: u64,
    pub total_cents: i64,
    pub median_price_cents: Option<i64>,
    /// Versus buying the full quantity at the median supplier price.
    pub estimated_savings_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrugStats {
    #[serde(flatten)]
    pub drug: Drug,
    pub price_count: i64,
    pub supplier_count: i64,
    pub lowest_price_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStatistics {
    pub drug_count: i64,
    pub price_count: i64,
    pub outlier_count: i64,
    pub running_tasks: i64,
    pub pending_tasks: i64,
}

pub struct AnalyticsService {
    drugs: DrugRepository,
    prices: PriceRepository,
    tasks: TaskRepository,
}

impl AnalyticsService {
    pub fn new(drugs: DrugRepository, prices: PriceRepository, tasks: TaskRepository) -> Self {
        Self {
            drugs,
            prices,
            tasks,
        }
    }

    pub async fn search_drugs(
        &self,
        query: &str,
        category: Option<ProductCategory>,
    ) -> CrawlResult<Vec<Drug>> {
        if query.trim().is_empty() {
            return Err(CrawlError::InvalidInput("query must not be empty".into()));
        }
        self.drugs.search_drugs(query, category, 100).await
    }

    pub async fn get_drug(&self, drug_id: i64) -> CrawlResult<Option<Drug>> {
        self.drugs.get_drug(drug_id).await
    }

    pub async fn get_prices(
        &self,
        drug_id: i64,
        include_outliers: bool,
    ) -> CrawlResult<Vec<PriceRecord>> {
        self.prices.get_prices(drug_id, include_outliers).await
    }

    pub async fn price_history(
        &self,
        drug_id: i64,
        days: i64,
        include_outliers: bool,
    ) -> CrawlResult<Vec<PriceRecord>> {
        self.prices.price_history(drug_id, days, include_outliers).await
    }

    /// Latest price per supplier, sorted ascending, with spread stats.
    pub async fn compare_drug(
        &self,
        drug_id: i64,
        include_outliers: bool,
    ) -> CrawlResult<Option<ComparisonView>> {
        let Some(drug) = self.drugs.get_drug(drug_id).await? else {
            return Ok(None);
        };
        let rows = self.prices.get_prices(drug_id, include_outliers).await?;

        // Rows arrive newest-first, so the first row per supplier is its
        // latest observation.
        let mut latest: HashMap<String, SupplierPrice> = HashMap::new();
        for row in rows {
            let key = match row.supplier_id {
                Some(id) => format!("#{id}"),
                None => row.supplier_name.clone(),
            };
            latest.entry(key).or_insert(SupplierPrice {
                supplier_name: row.supplier_name,
                supplier_id: row.supplier_id,
                price_cents: row.price_cents,
                crawled_at: row.crawled_at,
            });
        }

        let mut suppliers: Vec<SupplierPrice> = latest.into_values().collect();
        suppliers.sort_by(|a, b| {
            a.price_cents
                .cmp(&b.price_cents)
                .then(b.crawled_at.cmp(&a.crawled_at))
        });

        let lowest_cents = suppliers.first().map(|s| s.price_cents);
        let highest_cents = suppliers.last().map(|s| s.price_cents);
        let diff_pct = match (lowest_cents, highest_cents) {
            (Some(low), Some(high)) if low > 0 => {
                Some((high - low) as f64 / low as f64 * 100.0)
            }
            _ => None,
        };

        Ok(Some(ComparisonView {
            drug,
            suppliers,
            lowest_cents,
            highest_cents,
            diff_pct,
        }))
    }

    /// Greedy allocation against the ascending price list, bounded by the
    /// requested quantity and, when given, a budget in cents.
    pub async fn recommend_procurement(
        &self,
        drug_id: i64,
        quantity: u64,
        budget_cents: Option<i64>,
    ) -> CrawlResult<Option<Recommendation>> {
        if quantity == 0 {
            return Err(CrawlError::InvalidInput("quantity must be at least 1".into()));
        }
        let Some(view) = self.compare_drug(drug_id, false).await? else {
            return Ok(None);
        };

        let median_price_cents = median(&view.suppliers.iter().map(|s| s.price_cents).collect::<Vec<_>>());

        let mut remaining = quantity;
        let mut budget = budget_cents;
        let mut allocations = Vec::new();
        let mut total_cents = 0i64;

        for supplier in &view.suppliers {
            if remaining == 0 {
                break;
            }
            if supplier.price_cents <= 0 {
                continue;
            }
            let affordable = match budget {
                Some(b) => (b / supplier.price_cents).max(0) as u64,
                None => remaining,
            };
            let take = remaining.min(affordable);
            if take == 0 {
                break;
            }
            let subtotal = supplier.price_cents * take as i64;
            allocations.push(Allocation {
                supplier_name: supplier.supplier_name.clone(),
                price_cents: supplier.price_cents,
                quantity: take,
                subtotal_cents: subtotal,
            });
            total_cents += subtotal;
            remaining -= take;
            if let Some(b) = budget.as_mut() {
                *b -= subtotal;
            }
        }

        let fulfilled = quantity - remaining;
        let estimated_savings_cents = match median_price_cents {
            Some(median) if fulfilled > 0 => median * fulfilled as i64 - total_cents,
            _ => 0,
        };

        Ok(Some(Recommendation {
            drug_id,
            requested_quantity: quantity,
            allocations,
            fulfilled_quantity: fulfilled,
            total_cents,
            median_price_cents,
            estimated_savings_cents,
        }))
    }

    /// Drug listing with per-drug price stats for the console table.
    pub async fn list_drugs_with_stats(
        &self,
        limit: i64,
        offset: i64,
    ) -> CrawlResult<Vec<DrugStats>> {
        let drugs = self.drugs.list_drugs(limit, offset).await?;
        let mut out = Vec::with_capacity(drugs.len());
        for drug in drugs {
            let rows = self.prices.get_prices(drug.id, false).await?;
            let mut suppliers: Vec<&str> = rows.iter().map(|r| r.supplier_name.as_str()).collect();
            suppliers.sort_unstable();
            suppliers.dedup();
            out.push(DrugStats {
                price_count: rows.len() as i64,
                supplier_count: suppliers.len() as i64,
                lowest_price_cents: rows.iter().map(|r| r.price_cents).min(),
                drug,
            });
        }
        Ok(out)
    }

    pub async fn statistics(&self) -> CrawlResult<CorpusStatistics> {
        Ok(CorpusStatistics {
            drug_count: self.drugs.count_drugs().await?,
            price_count: self.prices.count_prices().await?,
            outlier_count: self.prices.count_outliers().await?,
            running_tasks: self.tasks.count_tasks_by_status(TaskStatus::Running).await?,
            pending_tasks: self.tasks.count_tasks_by_status(TaskStatus::Pending).await?,
        })
    }
}

fn median(sorted_ascending: &[i64]) -> Option<i64> {
    if sorted_ascending.is_empty() {
        return None;
    }
    let n = sorted_ascending.len();
    Some(if n % 2 == 1 {
        sorted_ascending[n / 2]
    } else {
        (sorted_ascending[n / 2 - 1] + sorted_ascending[n / 2]) / 2
    })
}
