//! Core domain types: drugs, price observations, watch list, crawl tasks.
//!
//! Prices are carried as integer cents (×100) everywhere inside the system;
//! only the HTTP boundary renders them with two decimals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, Type};

/// Product category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Drug,
    Cosmetic,
    MedicalDevice,
    HealthProduct,
    Unknown,
}

impl ProductCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drug => "drug",
            Self::Cosmetic => "cosmetic",
            Self::MedicalDevice => "medical_device",
            Self::HealthProduct => "health_product",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drug" => Some(Self::Drug),
            "cosmetic" => Some(Self::Cosmetic),
            "medical_device" => Some(Self::MedicalDevice),
            "health_product" => Some(Self::HealthProduct),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl Type<sqlx::Sqlite> for ProductCategory {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, sqlx::Sqlite> for ProductCategory {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> sqlx::encode::IsNull {
        <String as Encode<sqlx::Sqlite>>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> Decode<'r, sqlx::Sqlite> for ProductCategory {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as Decode<sqlx::Sqlite>>::decode(value)?;
        Self::parse(&s).ok_or_else(|| format!("Invalid ProductCategory: {s}").into())
    }
}

/// Where a category assignment came from, kept so later crawls can decide
/// whether their signal is allowed to overwrite the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorySource {
    Api,
    Keyword,
    Browser,
    Manual,
    Default,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Keyword => "keyword",
            Self::Browser => "browser",
            Self::Manual => "manual",
            Self::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(Self::Api),
            "keyword" => Some(Self::Keyword),
            "browser" => Some(Self::Browser),
            "manual" => Some(Self::Manual),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

impl Type<sqlx::Sqlite> for CategorySource {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, sqlx::Sqlite> for CategorySource {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> sqlx::encode::IsNull {
        <String as Encode<sqlx::Sqlite>>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> Decode<'r, sqlx::Sqlite> for CategorySource {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as Decode<sqlx::Sqlite>>::decode(value)?;
        Self::parse(&s).ok_or_else(|| format!("Invalid CategorySource: {s}").into())
    }
}

/// A sellable product identity. The (name, specification, manufacturer)
/// tuple is unique after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drug {
    pub id: i64,
    pub upstream_id: Option<i64>,
    pub name: String,
    pub specification: String,
    pub manufacturer: String,
    pub category: ProductCategory,
    pub category_confidence: f64,
    pub category_source: CategorySource,
    pub approval_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One observed supplier offer at one instant. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub id: i64,
    pub drug_id: i64,
    pub price_cents: i64,
    pub supplier_name: String,
    pub supplier_id: Option<i64>,
    pub source_url: String,
    pub crawled_at: DateTime<Utc>,
    /// 0 normal, 1 high, -1 low, 2 placeholder.
    pub is_outlier: i64,
    pub outlier_reason: Option<String>,
}

impl PriceRecord {
    pub fn price_yuan(&self) -> f64 {
        self.price_cents as f64 / 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrugAlias {
    pub id: i64,
    pub drug_id: i64,
    pub alias_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchListItem {
    pub id: i64,
    pub keyword: String,
    pub category_hint: Option<String>,
    /// 0 normal, 1 important, 2 urgent.
    pub priority: i64,
    pub enabled: bool,
    pub added_at: DateTime<Utc>,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> sqlx::encode::IsNull {
        <String as Encode<sqlx::Sqlite>>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as Decode<sqlx::Sqlite>>::decode(value)?;
        Self::parse(&s).ok_or_else(|| format!("Invalid TaskStatus: {s}").into())
    }
}

/// A batch crawl over an ordered keyword set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub id: i64,
    pub name: String,
    pub keywords: Vec<String>,
    pub status: TaskStatus,
    pub total_keywords: i64,
    pub completed_keywords: i64,
    pub failed_keywords: i64,
    pub total_items: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorRuleKind {
    PriceDrop,
    PriceRise,
    NewSupplier,
}

impl MonitorRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceDrop => "price_drop",
            Self::PriceRise => "price_rise",
            Self::NewSupplier => "new_supplier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "price_drop" => Some(Self::PriceDrop),
            "price_rise" => Some(Self::PriceRise),
            "new_supplier" => Some(Self::NewSupplier),
            _ => None,
        }
    }
}

impl Type<sqlx::Sqlite> for MonitorRuleKind {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, sqlx::Sqlite> for MonitorRuleKind {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> sqlx::encode::IsNull {
        <String as Encode<sqlx::Sqlite>>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> Decode<'r, sqlx::Sqlite> for MonitorRuleKind {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as Decode<sqlx::Sqlite>>::decode(value)?;
        Self::parse(&s).ok_or_else(|| format!("Invalid MonitorRuleKind: {s}").into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRule {
    pub id: i64,
    pub drug_id: i64,
    pub kind: MonitorRuleKind,
    pub threshold_pct: f64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Emitted by rule evaluation over new price rows. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub drug_id: i64,
    pub rule_kind: MonitorRuleKind,
    pub message: String,
    pub old_price_cents: Option<i64>,
    pub new_price_cents: Option<i64>,
    pub change_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Which acquisition pass produced an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferProvenance {
    Endpoint,
    Browser,
}

/// One supplier's observed price for one product, as collected by either
/// acquisition pass. Raw strings here; normalization happens at ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub name: String,
    pub specification: String,
    pub manufacturer: String,
    pub price_cents: i64,
    pub supplier_name: String,
    pub supplier_id: Option<i64>,
    pub upstream_drug_id: Option<i64>,
    pub wholesale_id: Option<i64>,
    pub source_url: String,
    pub provenance: OfferProvenance,
}

/// A product summary row from the upstream search endpoint: min/max price
/// and supplier count, without per-supplier prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrugAggregate {
    pub name: String,
    pub specification: String,
    pub manufacturer: String,
    pub upstream_id: Option<i64>,
    pub min_price_cents: i64,
    pub max_price_cents: i64,
    pub supplier_count: i64,
}

/// A supplier facet row; never carries prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supplier {
    pub id: Option<i64>,
    pub name: String,
}
