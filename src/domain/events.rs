//! Progress events pushed from the batch scheduler to the operator console.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a single keyword's acquisition inside a batch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    /// Keyword picked up by a worker.
    Started,
    /// Endpoint pass finished.
    Endpoint,
    /// Browser pass finished.
    Browser,
    /// Rows persisted and annotated.
    Persisted,
    /// Keyword finished (ok or failed).
    Finished,
}

/// One structured progress record. Consumed over the SSE push channel; the
/// broadcast never blocks the scheduler (lagging receivers drop events).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: i64,
    pub keyword: String,
    pub phase: CrawlPhase,
    pub ok: bool,
    /// Price rows written for this keyword so far.
    pub items: u64,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(task_id: i64, keyword: &str, phase: CrawlPhase) -> Self {
        Self {
            task_id,
            keyword: keyword.to_string(),
            phase,
            ok: true,
            items: 0,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_items(mut self, items: u64) -> Self {
        self.items = items;
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.ok = false;
        self.message = Some(message.into());
        self
    }
}
