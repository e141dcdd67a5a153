//! Error taxonomy shared across the acquisition and persistence layers.
//!
//! Each variant is a seam the propagation policy cares about: the upstream
//! client retries network blips locally, the orchestrator downgrades browser
//! failures to partial results, and the scheduler folds per-keyword errors
//! into task counters without aborting the batch.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("credential exchange rejected by upstream")]
    Auth,

    #[error("upstream HTTP error {status}: {body_excerpt}")]
    UpstreamClient { status: u16, body_excerpt: String },

    #[error("upstream envelope code {code}: {message}")]
    UpstreamProtocol { code: String, message: String },

    #[error("upstream throttling, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("browser harvest failed: {reason}")]
    BrowserHarvest { reason: String },

    #[error("record cannot be normalized: {0}")]
    Normalization(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CrawlError {
    pub fn upstream_client(status: u16, body: &str) -> Self {
        let mut excerpt: String = body.chars().take(200).collect();
        if body.len() > excerpt.len() {
            excerpt.push('…');
        }
        Self::UpstreamClient {
            status,
            body_excerpt: excerpt,
        }
    }

    pub fn browser(reason: impl Into<String>) -> Self {
        Self::BrowserHarvest {
            reason: reason.into(),
        }
    }

    /// Whether a retry at the call site can plausibly succeed.
    ///
    /// Auth failures are terminal for the current operation (the broker
    /// already got its one refresh); protocol and input errors will not
    /// change on replay.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Status 0 marks a transport-level failure (no response at all).
            Self::UpstreamClient { status, .. } => *status >= 500 || *status == 0,
            Self::RateLimited { .. } => true,
            Self::BrowserHarvest { .. } => true,
            Self::Persistence(_) => false,
            Self::Auth
            | Self::UpstreamProtocol { .. }
            | Self::Normalization(_)
            | Self::Cancelled
            | Self::InvalidInput(_) => false,
        }
    }

    /// Delay the caller should honor before retrying, when the upstream
    /// signaled one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;
