use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::auth::TokenStore;
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{DEFAULT_API_BASE_URL, SUBSCRIPTION_KEY_HEADER};
use crate::{Error, Result};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(500);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// How an upstream HTTP outcome is treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    AuthExpired,
    RateLimited,
    ServerError,
    ClientError,
    NetworkError,
}

impl Classification {
    /// 409 counts as success: the upstream uses it for "already in that state".
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            200..=299 | 409 => Classification::Success,
            401 => Classification::AuthExpired,
            429 => Classification::RateLimited,
            500..=599 => Classification::ServerError,
            _ => Classification::ClientError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Physical attempts allowed for 5xx and transport failures.
    pub max_attempts: u32,
    /// First backoff delay; doubles after every failed attempt.
    pub base_delay: Duration,
    /// Minimum gap between two physical attempts, contended or not.
    pub min_spacing: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            min_spacing: DEFAULT_MIN_SPACING,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// A `reqwest` client with a connect timeout shorter than the total one.
pub fn http_client(policy: &RetryPolicy) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(policy.connect_timeout)
        .timeout(policy.request_timeout)
        .build()?)
}

/// Successful (or success-like) upstream response. A body that is empty or
/// not JSON is reported as `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
}

/// Point-in-time view of the client's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Physical attempts, retries included.
    pub calls: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub other_failures: u64,
    pub last_call_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
    other_failures: AtomicU64,
    last_call_at: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    fn record_attempt(&self) -> u64 {
        *self.last_call_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Retry budget shared by 5xx and transport failures within one call.
struct Backoff {
    failures: u32,
    max_attempts: u32,
    delay: Duration,
}

impl Backoff {
    /// Count a failure. While budget remains, sleeps for the current delay,
    /// doubles it and returns `true`.
    async fn retry(&mut self, class: Classification, path: &str) -> bool {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            return false;
        }
        warn!(
            path,
            classification = ?class,
            failures = self.failures,
            delay_ms = self.delay.as_millis() as u64,
            "retryable failure, backing off"
        );
        sleep(self.delay).await;
        self.delay *= 2;
        true
    }
}

pub struct ApiClientBuilder {
    tokens: Arc<TokenStore>,
    subscription_key: String,
    base_url: String,
    policy: RetryPolicy,
    http: Option<reqwest::Client>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl ApiClientBuilder {
    pub fn new(tokens: Arc<TokenStore>, subscription_key: impl Into<String>) -> Self {
        Self {
            tokens,
            subscription_key: subscription_key.into(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            policy: RetryPolicy::default(),
            http: None,
            log_mode: None,
            log_path: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reuse an existing `reqwest` client instead of building one from the policy.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let http = match self.http {
            Some(http) => http,
            None => http_client(&self.policy)?,
        };

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        Ok(ApiClient {
            http,
            base_url: self.base_url,
            subscription_key: self.subscription_key,
            tokens: self.tokens,
            permit: Semaphore::new(1),
            last_attempt: Mutex::new(None),
            policy: self.policy,
            counters: Counters::default(),
            auth_broken: AtomicBool::new(false),
            logger,
        })
    }
}

/// Authenticated client for the thermostat cloud API.
///
/// Every call goes through a single permit, so calls from the poller and
/// from user commands queue behind each other and never overlap. 401 gets
/// one token refresh and one retry, 429 is never retried, 5xx and transport
/// failures are retried with exponential backoff.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    subscription_key: String,
    tokens: Arc<TokenStore>,
    permit: Semaphore,
    last_attempt: Mutex<Option<Instant>>,
    policy: RetryPolicy,
    counters: Counters,
    auth_broken: AtomicBool,
    logger: Option<Mutex<MessageLogger>>,
}

impl ApiClient {
    pub fn builder(tokens: Arc<TokenStore>, subscription_key: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(tokens, subscription_key)
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn is_auth_broken(&self) -> bool {
        self.auth_broken.load(Ordering::SeqCst)
    }

    pub(crate) fn set_auth_broken(&self, broken: bool) {
        self.auth_broken.store(broken, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CallStats {
        CallStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            other_failures: self.counters.other_failures.load(Ordering::Relaxed),
            last_call_at: *self
                .counters
                .last_call_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.call(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.call(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.call(Method::DELETE, path, None).await
    }

    fn refuse_if_auth_broken(&self, path: &str) -> Result<()> {
        if self.is_auth_broken() {
            warn!(path, "authentication broken, skipping request");
            Counters::bump(&self.counters.auth_failures);
            return Err(Error::AuthBroken);
        }
        Ok(())
    }

    pub async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.refuse_if_auth_broken(path)?;

        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| Error::Config("request permit closed".to_string()))?;
        // The call holding the permit before us may have broken authentication.
        self.refuse_if_auth_broken(path)?;

        let mut credential = match self.tokens.get_valid_credential().await {
            Ok(c) => c,
            Err(e) => return Err(self.fail_refresh(e)),
        };

        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        let mut refreshed = false;
        let mut backoff = Backoff {
            failures: 0,
            max_attempts: self.policy.max_attempts,
            delay: self.policy.base_delay,
        };

        loop {
            attempt += 1;
            self.pace().await;
            let call_no = self.counters.record_attempt();
            debug!(call = call_no, attempt, method = %method, path, "upstream request");

            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&credential.access_token)
                .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key);
            if let Some(body) = body {
                req = req.json(body);
            }

            let received = match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    resp.text().await.map(|text| (status, text))
                }
                Err(e) => Err(e),
            };

            let (status, text) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    self.log_attempt(&method, path, attempt, None, body);
                    if backoff.retry(Classification::NetworkError, path).await {
                        continue;
                    }
                    error!(path, attempts = backoff.failures, error = %e, "network error, giving up");
                    Counters::bump(&self.counters.other_failures);
                    return Err(Error::Http(e));
                }
            };
            self.log_attempt(&method, path, attempt, Some(status.as_u16()), body);

            match Classification::from_status(status) {
                Classification::Success => {
                    Counters::bump(&self.counters.successes);
                    return Ok(ApiResponse {
                        status: status.as_u16(),
                        data: serde_json::from_str(&text).unwrap_or(Value::Null),
                    });
                }
                Classification::AuthExpired if !refreshed => {
                    warn!(path, "401 unauthorized, refreshing token");
                    refreshed = true;
                    credential = match self.tokens.refresh_after(&credential).await {
                        Ok(c) => c,
                        Err(e) => return Err(self.fail_refresh(e)),
                    };
                }
                Classification::AuthExpired => {
                    error!(path, "401 again after token refresh");
                    Counters::bump(&self.counters.auth_failures);
                    return Err(Error::Auth("unauthorized after token refresh".to_string()));
                }
                Classification::RateLimited => {
                    error!(path, attempt, "429 rate limited, not retrying");
                    Counters::bump(&self.counters.rate_limited);
                    return Err(Error::RateLimited {
                        path: path.to_string(),
                    });
                }
                Classification::ServerError => {
                    if !backoff.retry(Classification::ServerError, path).await {
                        error!(path, status = status.as_u16(), attempts = backoff.failures, "server error, giving up");
                        Counters::bump(&self.counters.other_failures);
                        return Err(Error::Api {
                            status: status.as_u16(),
                            message: format!("server error after {} attempts: {text}", backoff.failures),
                        });
                    }
                }
                Classification::ClientError | Classification::NetworkError => {
                    error!(path, status = status.as_u16(), body = %text, "client error");
                    Counters::bump(&self.counters.other_failures);
                    return Err(Error::Api {
                        status: status.as_u16(),
                        message: text,
                    });
                }
            }
        }
    }

    /// A failed refresh means the refresh token itself is no good; stop
    /// talking to the upstream until an operator intervenes.
    fn fail_refresh(&self, e: Error) -> Error {
        error!(error = %e, "token refresh failed, marking authentication as broken");
        self.set_auth_broken(true);
        Counters::bump(&self.counters.auth_failures);
        match e {
            Error::Auth(_) => e,
            other => Error::Auth(other.to_string()),
        }
    }

    async fn pace(&self) {
        let wait = {
            let mut last = self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let wait = match *last {
                Some(prev) => (prev + self.policy.min_spacing).saturating_duration_since(now),
                None => Duration::ZERO,
            };
            *last = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    fn log_attempt(&self, method: &Method, path: &str, attempt: u32, status: Option<u16>, body: Option<&Value>) {
        if let Some(ref logger) = self.logger {
            logger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .log_attempt(method.as_str(), path, attempt, status, body);
        }
    }

    pub(crate) fn log_command(&self, action: &str, device: &str, body: &Value) {
        if let Some(ref logger) = self.logger {
            logger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .log_command(action, device, body);
        }
    }
}
