//! Repository for drug identities and aliases.
//!
//! The identity tuple (name, specification, manufacturer) arrives already
//! normalized; this layer enforces its uniqueness and the monotonic
//! category-confidence rule.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::domain::classifier::Classification;
use crate::domain::entities::{CategorySource, Drug, ProductCategory};
use crate::domain::normalizer::IdentityKey;
use crate::errors::CrawlResult;

/// Fields written alongside an identity on first sight or refresh.
#[derive(Debug, Clone)]
pub struct DrugFields {
    pub upstream_id: Option<i64>,
    pub classification: Classification,
    pub approval_number: Option<String>,
}

#[derive(Clone)]
pub struct DrugRepository {
    pool: Arc<SqlitePool>,
}

impl DrugRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Atomic read-or-insert on the identity tuple, inside the caller's
    /// transaction. On revisit the category moves only when the new
    /// confidence is at least the stored one, and the approval number only
    /// fills in when currently null.
    pub async fn upsert_drug(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        identity: &IdentityKey,
        fields: &DrugFields,
    ) -> CrawlResult<i64> {
        let existing = sqlx::query(
            "SELECT id, category_confidence, approval_number, upstream_id FROM drugs
             WHERE name = ? AND specification = ? AND manufacturer = ?",
        )
        .bind(&identity.name)
        .bind(&identity.specification)
        .bind(&identity.manufacturer)
        .fetch_optional(&mut **tx)
        .await?;

        let now = Utc::now();
        if let Some(row) = existing {
            let id: i64 = row.get("id");
            let stored_confidence: f64 = row.get("category_confidence");
            let stored_approval: Option<String> = row.get("approval_number");
            let stored_upstream: Option<i64> = row.get("upstream_id");

            if fields.classification.confidence >= stored_confidence {
                sqlx::query(
                    "UPDATE drugs SET category = ?, category_confidence = ?, category_source = ?,
                     updated_at = ? WHERE id = ?",
                )
                .bind(fields.classification.category)
                .bind(fields.classification.confidence)
                .bind(fields.classification.source)
                .bind(now)
                .bind(id)
                .execute(&mut **tx)
                .await?;
            } else {
                sqlx::query("UPDATE drugs SET updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }

            if stored_approval.is_none() && fields.approval_number.is_some() {
                sqlx::query("UPDATE drugs SET approval_number = ? WHERE id = ?")
                    .bind(&fields.approval_number)
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
            if stored_upstream.is_none() && fields.upstream_id.is_some() {
                sqlx::query("UPDATE drugs SET upstream_id = ? WHERE id = ?")
                    .bind(fields.upstream_id)
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
            return Ok(id);
        }

        let result = sqlx::query(
            "INSERT INTO drugs (upstream_id, name, specification, manufacturer, category,
             category_confidence, category_source, approval_number, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(fields.upstream_id)
        .bind(&identity.name)
        .bind(&identity.specification)
        .bind(&identity.manufacturer)
        .bind(fields.classification.category)
        .bind(fields.classification.confidence)
        .bind(fields.classification.source)
        .bind(&fields.approval_number)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_drug(&self, id: i64) -> CrawlResult<Option<Drug>> {
        let row = sqlx::query(
            "SELECT id, upstream_id, name, specification, manufacturer, category,
             category_confidence, category_source, approval_number, created_at, updated_at
             FROM drugs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(map_drug))
    }

    /// Substring search across name, specification, and aliases, most
    /// recently active first.
    pub async fn search_drugs(
        &self,
        query: &str,
        category: Option<ProductCategory>,
        limit: i64,
    ) -> CrawlResult<Vec<Drug>> {
        let pattern = format!("%{}%", query.trim());
        let rows = match category {
            Some(category) => {
                sqlx::query(
                    "SELECT DISTINCT d.id, d.upstream_id, d.name, d.specification, d.manufacturer,
                     d.category, d.category_confidence, d.category_source, d.approval_number,
                     d.created_at, d.updated_at
                     FROM drugs d
                     LEFT JOIN drug_aliases a ON a.drug_id = d.id
                     WHERE (d.name LIKE ?1 OR d.specification LIKE ?1 OR a.alias_name LIKE ?1)
                       AND d.category = ?2
                     ORDER BY d.updated_at DESC LIMIT ?3",
                )
                .bind(&pattern)
                .bind(category)
                .bind(limit)
                .fetch_all(&*self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT DISTINCT d.id, d.upstream_id, d.name, d.specification, d.manufacturer,
                     d.category, d.category_confidence, d.category_source, d.approval_number,
                     d.created_at, d.updated_at
                     FROM drugs d
                     LEFT JOIN drug_aliases a ON a.drug_id = d.id
                     WHERE d.name LIKE ?1 OR d.specification LIKE ?1 OR a.alias_name LIKE ?1
                     ORDER BY d.updated_at DESC LIMIT ?2",
                )
                .bind(&pattern)
                .bind(limit)
                .fetch_all(&*self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(map_drug).collect())
    }

    pub async fn list_drugs(&self, limit: i64, offset: i64) -> CrawlResult<Vec<Drug>> {
        let rows = sqlx::query(
            "SELECT id, upstream_id, name, specification, manufacturer, category,
             category_confidence, category_source, approval_number, created_at, updated_at
             FROM drugs ORDER BY updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.into_iter().map(map_drug).collect())
    }

    pub async fn count_drugs(&self) -> CrawlResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM drugs")
            .fetch_one(&*self.pool)
            .await?)
    }

    /// Aliases are non-unique alternative names used for search expansion.
    pub async fn add_alias(&self, drug_id: i64, alias: &str) -> CrawlResult<()> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM drug_aliases WHERE drug_id = ? AND alias_name = ?",
        )
        .bind(drug_id)
        .bind(alias)
        .fetch_optional(&*self.pool)
        .await?;
        if exists.is_some() {
            return Ok(());
        }
        sqlx::query("INSERT INTO drug_aliases (drug_id, alias_name) VALUES (?, ?)")
            .bind(drug_id)
            .bind(alias)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}

fn map_drug(row: sqlx::sqlite::SqliteRow) -> Drug {
    Drug {
        id: row.get("id"),
        upstream_id: row.get("upstream_id"),
        name: row.get("name"),
        specification: row.get("specification"),
        manufacturer: row.get("manufacturer"),
        category: row.get("category"),
        category_confidence: row.get("category_confidence"),
        category_source: row.get("category_source"),
        approval_number: row.get("approval_number"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl Default for DrugFields {
    fn default() -> Self {
        Self {
            upstream_id: None,
            classification: Classification {
                category: ProductCategory::Unknown,
                confidence: 0.0,
                source: CategorySource::Default,
                reason: "unclassified".to_string(),
            },
            approval_number: None,
        }
    }
}
