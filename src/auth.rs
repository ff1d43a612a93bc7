use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHandle;
use crate::protocol::TOKEN_PATH;
use crate::{Error, Result};

/// Refresh this long before the upstream expiry so a token never lapses mid-call.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Bearer credential pair. Never mutated: a refresh builds a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + TimeDelta::seconds(REFRESH_MARGIN_SECS) >= self.expires_at
    }
}

/// OAuth application data used for the `refresh_token` grant.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    pub auth_base_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Holds the current credential and collapses concurrent refreshes.
///
/// Callers that hit a 401 pass in the credential they used; if another task
/// already replaced it while they waited for the refresh lock, they get the
/// replacement without another round-trip.
pub struct TokenStore {
    http: reqwest::Client,
    endpoint: TokenEndpoint,
    current: RwLock<Arc<Credential>>,
    refresh_lock: Mutex<()>,
    config: Option<ConfigHandle>,
    refreshes: AtomicU64,
}

impl TokenStore {
    pub fn new(http: reqwest::Client, endpoint: TokenEndpoint, credential: Credential) -> Self {
        Self {
            http,
            endpoint,
            current: RwLock::new(Arc::new(credential)),
            refresh_lock: Mutex::new(()),
            config: None,
            refreshes: AtomicU64::new(0),
        }
    }

    /// Persist every refreshed credential through `config`.
    pub fn with_persistence(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn current(&self) -> Arc<Credential> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful network refreshes since construction.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// The current credential, refreshed first if it is expired or about to be.
    pub async fn get_valid_credential(&self) -> Result<Arc<Credential>> {
        let current = self.current();
        if !current.needs_refresh(Utc::now()) {
            return Ok(current);
        }
        debug!(expires_at = %current.expires_at, "credential expiring, refreshing before use");
        self.refresh_after(&current).await
    }

    /// Replace `stale` with a fresh credential, unless someone already did.
    pub async fn refresh_after(&self, stale: &Credential) -> Result<Arc<Credential>> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.current();
        if current.access_token != stale.access_token {
            debug!("token already refreshed by another caller");
            return Ok(current);
        }
        self.exchange(&current).await
    }

    /// Unconditionally exchange the refresh token. Leaves any broken-auth
    /// bookkeeping to the caller.
    pub async fn force_refresh(&self) -> bool {
        let _guard = self.refresh_lock.lock().await;
        let current = self.current();
        match self.exchange(&current).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "forced token refresh failed");
                false
            }
        }
    }

    async fn exchange(&self, previous: &Credential) -> Result<Arc<Credential>> {
        let url = format!("{}{}", self.endpoint.auth_base_url, TOKEN_PATH);
        debug!(url = %url, "refreshing access token");

        let form = [
            ("refresh_token", previous.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("client_secret", self.endpoint.client_secret.as_str()),
            ("client_id", self.endpoint.client_id.as_str()),
        ];
        let resp = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Auth(format!("token response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(Error::Auth(format!("token endpoint returned {}: {body}", status.as_u16())));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| Error::Auth(format!("token response is not JSON: {e}")))?;
        let credential = Arc::new(parse_token_response(&json, &previous.refresh_token, Utc::now())?);

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = credential.clone();
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(expires_at = %credential.expires_at, "access token refreshed");

        if let Some(ref config) = self.config {
            let saved = config.update(|stored| stored.set_credential(&credential));
            if let Err(e) = saved {
                warn!(error = %e, "refreshed token could not be persisted");
            }
        }

        Ok(credential)
    }
}

/// Build a credential from a token endpoint response. Expiry comes from
/// `expires_in` (seconds from now) or `expires_on` (epoch seconds); either may
/// be a number or a numeric string. A response without a new refresh token
/// keeps the previous one.
pub(crate) fn parse_token_response(
    body: &Value,
    previous_refresh: &str,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(strip_bearer)
        .ok_or_else(|| Error::Auth("token response without access_token".to_string()))?;

    let refresh_token = body
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(previous_refresh)
        .to_string();

    let expires_at = if let Some(secs) = body.get("expires_in").and_then(as_seconds) {
        now + TimeDelta::seconds(secs)
    } else if let Some(epoch) = body.get("expires_on").and_then(as_seconds) {
        DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| Error::Auth(format!("expires_on out of range: {epoch}")))?
    } else {
        return Err(Error::Auth("token response without expires_in or expires_on".to_string()));
    };

    Ok(Credential {
        access_token,
        refresh_token,
        expires_at,
    })
}

/// Stored tokens from older setups carry the `Bearer ` scheme inline.
pub(crate) fn strip_bearer(token: &str) -> String {
    token.strip_prefix("Bearer ").unwrap_or(token).to_string()
}

fn as_seconds(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
