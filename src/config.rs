//! Host-side configuration: what the integration reads at startup and writes
//! back when tokens rotate or options change.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{strip_bearer, Credential, TokenEndpoint};
use crate::protocol::{DEFAULT_API_BASE_URL, DEFAULT_AUTH_BASE_URL};
use crate::types::Program;
use crate::{Error, Result};

pub const DEFAULT_UPDATE_INTERVAL_MIN: u32 = 15;
pub const DEFAULT_COOL_DOWN_MIN: u32 = 60;
pub const DEFAULT_DEBOUNCE_SECS: f64 = 1.0;
pub const DEFAULT_STALE_AFTER_MIN: u32 = 120;

pub const UPDATE_INTERVAL_RANGE_MIN: (u32, u32) = (1, 120);
pub const COOL_DOWN_RANGE_MIN: (u32, u32) = (15, 180);
pub const DEBOUNCE_RANGE_SECS: (f64, f64) = (0.5, 5.0);
pub const STALE_AFTER_RANGE_MIN: (u32, u32) = (15, 1440);

/// Tunables the user can change at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Normal polling cadence, minutes.
    pub update_interval: u32,
    /// Polling cadence while cooling down after a 429, minutes.
    pub cool_down_interval: u32,
    /// Webhook debounce window, seconds.
    pub webhook_debounce: f64,
    pub notify_errors: bool,
    /// Snapshots older than this many minutes are dropped as unavailable.
    pub stale_after: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL_MIN,
            cool_down_interval: DEFAULT_COOL_DOWN_MIN,
            webhook_debounce: DEFAULT_DEBOUNCE_SECS,
            notify_errors: true,
            stale_after: DEFAULT_STALE_AFTER_MIN,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        check_minutes("update_interval", self.update_interval, UPDATE_INTERVAL_RANGE_MIN)?;
        check_minutes("cool_down_interval", self.cool_down_interval, COOL_DOWN_RANGE_MIN)?;
        check_debounce(self.webhook_debounce)?;
        check_minutes("stale_after", self.stale_after, STALE_AFTER_RANGE_MIN)?;
        Ok(())
    }

    pub fn normal_interval(&self) -> Duration {
        minutes(self.update_interval)
    }

    pub fn resume_interval(&self) -> Duration {
        minutes(self.cool_down_interval)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs_f64(self.webhook_debounce)
    }

    pub fn stale_after(&self) -> Duration {
        minutes(self.stale_after)
    }
}

pub(crate) fn minutes(m: u32) -> Duration {
    Duration::from_secs(u64::from(m) * 60)
}

pub(crate) fn check_minutes(name: &'static str, value: u32, (lo, hi): (u32, u32)) -> Result<()> {
    if value < lo || value > hi {
        return Err(Error::InvalidOption {
            name,
            value: format!("{value} (expected {lo}..={hi} minutes)"),
        });
    }
    Ok(())
}

pub(crate) fn check_debounce(value: f64) -> Result<()> {
    let (lo, hi) = DEBOUNCE_RANGE_SECS;
    if !(lo..=hi).contains(&value) {
        return Err(Error::InvalidOption {
            name: "webhook_debounce",
            value: format!("{value} (expected {lo}..={hi} seconds)"),
        });
    }
    Ok(())
}

/// One selected thermostat as stored by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedThermostat {
    pub plant_id: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub programs: Vec<Program>,
    pub webhook_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub client_id: String,
    pub client_secret: String,
    pub subscription_key: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,
    /// Public base URL of the host, used to build webhook endpoints.
    #[serde(default)]
    pub external_url: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token_expires_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub selected_thermostats: Vec<SelectedThermostat>,
    #[serde(default)]
    pub options: Options,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_auth_base_url() -> String {
    DEFAULT_AUTH_BASE_URL.to_string()
}

impl StoredConfig {
    /// The stored credential. Without a known expiry it is treated as
    /// already expired, so the first call refreshes it.
    pub fn credential(&self) -> Result<Credential> {
        if self.refresh_token.is_empty() {
            return Err(Error::Config("no refresh token stored".to_string()));
        }
        Ok(Credential {
            access_token: strip_bearer(&self.access_token),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.access_token_expires_on.unwrap_or_default(),
        })
    }

    pub fn set_credential(&mut self, credential: &Credential) {
        self.access_token = credential.access_token.clone();
        self.refresh_token = credential.refresh_token.clone();
        self.access_token_expires_on = Some(credential.expires_at);
    }

    pub fn token_endpoint(&self) -> TokenEndpoint {
        TokenEndpoint {
            auth_base_url: self.auth_base_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}

/// Persisted key/value store owned by the host.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<StoredConfig>;
    fn save(&self, config: &StoredConfig) -> Result<()>;
}

pub struct MemoryConfigStore {
    inner: Mutex<StoredConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: StoredConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<StoredConfig> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, config: &StoredConfig) -> Result<()> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }
}

/// Pretty-printed JSON file. Saves go through a sibling temp file and a
/// rename so a crash never leaves a half-written config.
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn load(&self) -> Result<StoredConfig> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, config: &StoredConfig) -> Result<()> {
        let raw = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Shared access to a [`ConfigStore`] with serialised read-modify-write.
#[derive(Clone)]
pub struct ConfigHandle {
    store: Arc<dyn ConfigStore>,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigHandle {
    pub fn new(store: impl ConfigStore + 'static) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn load(&self) -> Result<StoredConfig> {
        self.store.load()
    }

    pub fn update(&self, f: impl FnOnce(&mut StoredConfig)) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = self.store.load()?;
        f(&mut config);
        self.store.save(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        Options::default().validate().unwrap();
        assert_eq!(Options::default().normal_interval(), Duration::from_secs(15 * 60));
        assert_eq!(Options::default().resume_interval(), Duration::from_secs(60 * 60));
    }

    #[test]
    fn out_of_range_options_rejected() {
        let opts = Options { update_interval: 0, ..Options::default() };
        assert!(matches!(opts.validate(), Err(Error::InvalidOption { name: "update_interval", .. })));
        let opts = Options { cool_down_interval: 200, ..Options::default() };
        assert!(opts.validate().is_err());
        let opts = Options { webhook_debounce: 0.1, ..Options::default() };
        assert!(opts.validate().is_err());
    }

    fn sample() -> StoredConfig {
        serde_json::from_value(serde_json::json!({
            "client_id": "cid",
            "client_secret": "secret",
            "subscription_key": "key",
            "access_token": "Bearer abc",
            "refresh_token": "ref"
        }))
        .unwrap()
    }

    #[test]
    fn stored_credential_without_expiry_is_expired() {
        let stored = sample();
        assert_eq!(stored.api_base_url, DEFAULT_API_BASE_URL);
        let credential = stored.credential().unwrap();
        assert_eq!(credential.access_token, "abc");
        assert!(credential.needs_refresh(Utc::now()));
    }

    #[test]
    fn json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::new(JsonFileConfigStore::new(dir.path().join("bticino.json")));
        let mut stored = sample();
        stored.options.update_interval = 30;
        JsonFileConfigStore::new(dir.path().join("bticino.json")).save(&stored).unwrap();

        handle.update(|c| c.options.notify_errors = false).unwrap();
        let loaded = handle.load().unwrap();
        assert_eq!(loaded.options.update_interval, 30);
        assert!(!loaded.options.notify_errors);
        assert!(!dir.path().join("bticino.json.tmp").exists());
    }

    #[test]
    fn options_fill_defaults_from_partial_json() {
        let opts: Options = serde_json::from_str(r#"{"update_interval": 5}"#).unwrap();
        assert_eq!(opts.update_interval, 5);
        assert_eq!(opts.cool_down_interval, DEFAULT_COOL_DOWN_MIN);
        assert!(opts.notify_errors);
    }
}
