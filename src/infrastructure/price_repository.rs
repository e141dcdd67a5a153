//! Repository for price observations and their outlier annotations.
//!
//! Price rows are append-only: nothing here ever deletes a row or changes a
//! price. Annotation rewrites only the `is_outlier` / `outlier_reason`
//! columns, and a per-drug async lock keeps it from racing a concurrent
//! append on the same drug.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::entities::PriceRecord;
use crate::domain::outliers::judge_prices;
use crate::errors::CrawlResult;

/// One observation to append, already reduced to cents.
#[derive(Debug, Clone)]
pub struct PriceObservation {
    pub price_cents: i64,
    pub supplier_name: String,
    pub supplier_id: Option<i64>,
    pub source_url: String,
    pub crawled_at: DateTime<Utc>,
}

impl PriceObservation {
    /// Batch-dedup key: supplier id when known, otherwise supplier name.
    fn batch_key(&self) -> (String, i64) {
        let supplier = match self.supplier_id {
            Some(id) => format!("#{id}"),
            None => self.supplier_name.clone(),
        };
        (supplier, self.price_cents)
    }
}

#[derive(Clone)]
pub struct PriceRepository {
    pool: Arc<SqlitePool>,
    /// Per-drug annotation locks; see `annotate_drug`.
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl PriceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append observations inside the caller's transaction. Duplicates
    /// within the batch (same supplier, same price) collapse to one row;
    /// history is never consulted, so repeated crawls accumulate.
    pub async fn append_prices(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        drug_id: i64,
        observations: &[PriceObservation],
    ) -> CrawlResult<u64> {
        let mut seen: HashSet<(String, i64)> = HashSet::new();
        let mut inserted = 0u64;

        for obs in observations {
            if !seen.insert(obs.batch_key()) {
                continue;
            }
            sqlx::query(
                "INSERT INTO price_records
                 (drug_id, price_cents, supplier_name, supplier_id, source_url, crawled_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(drug_id)
            .bind(obs.price_cents)
            .bind(&obs.supplier_name)
            .bind(obs.supplier_id)
            .bind(&obs.source_url)
            .bind(obs.crawled_at)
            .execute(&mut **tx)
            .await?;
            inserted += 1;
        }

        Ok(inserted)
    }

    pub async fn get_prices(
        &self,
        drug_id: i64,
        include_outliers: bool,
    ) -> CrawlResult<Vec<PriceRecord>> {
        let sql = if include_outliers {
            "SELECT id, drug_id, price_cents, supplier_name, supplier_id, source_url,
             crawled_at, is_outlier, outlier_reason
             FROM price_records WHERE drug_id = ? ORDER BY crawled_at DESC, id DESC"
        } else {
            "SELECT id, drug_id, price_cents, supplier_name, supplier_id, source_url,
             crawled_at, is_outlier, outlier_reason
             FROM price_records WHERE drug_id = ? AND is_outlier = 0
             ORDER BY crawled_at DESC, id DESC"
        };
        let rows = sqlx::query(sql).bind(drug_id).fetch_all(&*self.pool).await?;
        Ok(rows.into_iter().map(map_price).collect())
    }

    /// Chronological price history over the trailing window.
    pub async fn price_history(
        &self,
        drug_id: i64,
        days: i64,
        include_outliers: bool,
    ) -> CrawlResult<Vec<PriceRecord>> {
        let since = Utc::now() - Duration::days(days.max(0));
        let sql = if include_outliers {
            "SELECT id, drug_id, price_cents, supplier_name, supplier_id, source_url,
             crawled_at, is_outlier, outlier_reason
             FROM price_records WHERE drug_id = ? AND crawled_at >= ?
             ORDER BY crawled_at ASC, id ASC"
        } else {
            "SELECT id, drug_id, price_cents, supplier_name, supplier_id, source_url,
             crawled_at, is_outlier, outlier_reason
             FROM price_records WHERE drug_id = ? AND crawled_at >= ? AND is_outlier = 0
             ORDER BY crawled_at ASC, id ASC"
        };
        let rows = sqlx::query(sql)
            .bind(drug_id)
            .bind(since)
            .fetch_all(&*self.pool)
            .await?;
        Ok(rows.into_iter().map(map_price).collect())
    }

    pub async fn count_prices(&self) -> CrawlResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM price_records")
            .fetch_one(&*self.pool)
            .await?)
    }

    pub async fn count_outliers(&self) -> CrawlResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM price_records WHERE is_outlier != 0")
                .fetch_one(&*self.pool)
                .await?,
        )
    }

    /// Re-judge the drug's full price set and rewrite annotations that
    /// changed. Non-destructive: prices and row count are untouched.
    pub async fn annotate_drug(&self, drug_id: i64) -> CrawlResult<u64> {
        let lock = self.lock_for(drug_id).await;
        let _guard = lock.lock().await;

        let rows = sqlx::query(
            "SELECT id, price_cents, is_outlier, outlier_reason
             FROM price_records WHERE drug_id = ? ORDER BY id ASC",
        )
        .bind(drug_id)
        .fetch_all(&*self.pool)
        .await?;

        let prices: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("price_cents")).collect();
        let verdicts = judge_prices(&prices);

        let mut changed = 0u64;
        for (row, verdict) in rows.iter().zip(verdicts.iter()) {
            let id: i64 = row.get("id");
            let current_flag: i64 = row.get("is_outlier");
            let current_reason: Option<String> = row.get("outlier_reason");
            if current_flag == verdict.flag.as_i64() && current_reason == verdict.reason {
                continue;
            }
            sqlx::query("UPDATE price_records SET is_outlier = ?, outlier_reason = ? WHERE id = ?")
                .bind(verdict.flag.as_i64())
                .bind(&verdict.reason)
                .bind(id)
                .execute(&*self.pool)
                .await?;
            changed += 1;
        }

        if changed > 0 {
            debug!("drug {drug_id}: re-annotated {changed} price rows");
        }
        Ok(changed)
    }

    async fn lock_for(&self, drug_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(drug_id).or_default().clone()
    }
}

fn map_price(row: sqlx::sqlite::SqliteRow) -> PriceRecord {
    PriceRecord {
        id: row.get("id"),
        drug_id: row.get("drug_id"),
        price_cents: row.get("price_cents"),
        supplier_name: row.get("supplier_name"),
        supplier_id: row.get("supplier_id"),
        source_url: row.get("source_url"),
        crawled_at: row.get("crawled_at"),
        is_outlier: row.get("is_outlier"),
        outlier_reason: row.get("outlier_reason"),
    }
}
