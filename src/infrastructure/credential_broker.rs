//! Session credential lifecycle for the upstream.
//!
//! Tokens come from a login exchange and are cached in memory and on disk.
//! The disk cache survives restarts (operators can also seed it by hand with
//! a token copied from a browser session). Refreshes are single-flight: the
//! cache mutex is held across the login exchange, so concurrent callers wait
//! for the in-flight result instead of stampeding the login endpoint.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{CrawlError, CrawlResult};
use crate::infrastructure::http_client::HttpClient;

const LOGIN_PATH: &str = "/ysb-user/api/auth/webLogin/v4270";

/// Token lifetime assumed when the upstream does not say otherwise.
const TOKEN_TTL_HOURS: i64 = 24;

/// The on-disk cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub obtained_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    code: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: Option<String>,
}

pub struct CredentialBroker {
    http: std::sync::Arc<HttpClient>,
    base_url: String,
    phone: Option<String>,
    password: Option<String>,
    cache_path: PathBuf,
    state: Mutex<Option<CachedToken>>,
}

impl CredentialBroker {
    pub fn new(
        http: std::sync::Arc<HttpClient>,
        base_url: impl Into<String>,
        phone: Option<String>,
        password: Option<String>,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            phone,
            password,
            cache_path,
            state: Mutex::new(None),
        }
    }

    /// Return a valid token, logging in if the cached one is missing or
    /// expired. At most one login is in flight per process.
    pub async fn get(&self, cancel: &CancellationToken) -> CrawlResult<CachedToken> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.as_ref() {
            if cached.is_valid() {
                return Ok(cached.clone());
            }
        }

        // Memory miss: another process (or a previous run) may have left a
        // usable token on disk.
        if let Some(from_disk) = self.load_cache() {
            if from_disk.is_valid() {
                *state = Some(from_disk.clone());
                return Ok(from_disk);
            }
        }

        let fresh = self.login(cancel).await?;
        self.store_cache(&fresh);
        *state = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached token so the next `get` performs a fresh login.
    /// Called by the upstream client on 401/403 or a token-expired envelope.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        *state = None;
        if self.cache_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.cache_path) {
                warn!("failed to remove token cache: {e}");
            }
        }
    }

    async fn login(&self, cancel: &CancellationToken) -> CrawlResult<CachedToken> {
        let (phone, password) = match (&self.phone, &self.password) {
            (Some(p), Some(pw)) => (p, pw),
            _ => {
                warn!("no upstream credentials configured and no cached token available");
                return Err(CrawlError::Auth);
            }
        };

        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        let body = json!({
            "phone": phone,
            "password": password,
            "loginType": 1,
        });

        let response = self.http.post_json(&url, &body, None, cancel).await?;
        let status = response.status();
        if !status.is_success() {
            warn!("login exchange failed with HTTP {status}");
            return Err(CrawlError::Auth);
        }

        let envelope: LoginEnvelope = response
            .json()
            .await
            .map_err(|e| CrawlError::upstream_client(0, &e.to_string()))?;

        let ok = matches!(envelope.code, serde_json::Value::Number(ref n) if n.as_i64() == Some(0))
            || matches!(envelope.code, serde_json::Value::String(ref s) if s == "0");
        let token = envelope.data.and_then(|d| d.token);

        match (ok, token) {
            (true, Some(token)) => {
                info!("upstream login succeeded");
                let now = Utc::now();
                Ok(CachedToken {
                    token,
                    expires_at: now + Duration::hours(TOKEN_TTL_HOURS),
                    obtained_at: now,
                })
            }
            _ => {
                warn!(
                    "upstream login rejected: {}",
                    envelope.message.unwrap_or_default()
                );
                Err(CrawlError::Auth)
            }
        }
    }

    fn load_cache(&self) -> Option<CachedToken> {
        let raw = std::fs::read_to_string(&self.cache_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!("ignoring unreadable token cache: {e}");
                None
            }
        }
    }

    /// Write-then-rename so a crash mid-write never leaves a torn cache.
    fn store_cache(&self, token: &CachedToken) {
        let tmp = self.cache_path.with_extension("json.tmp");
        let write = std::fs::write(&tmp, serde_json::to_vec_pretty(token).unwrap_or_default())
            .and_then(|_| std::fs::rename(&tmp, &self.cache_path));
        if let Err(e) = write {
            warn!("failed to persist token cache: {e}");
        }
    }
}
