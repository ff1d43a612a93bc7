use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::client::ApiClient;
use crate::config::{
    check_minutes, minutes, ConfigHandle, Options, COOL_DOWN_RANGE_MIN, UPDATE_INTERVAL_RANGE_MIN,
};
use crate::cooldown::CooldownState;
use crate::protocol::{parse_status_response, status_path};
use crate::registry::DeviceRegistry;
use crate::state::{DeviceStateTable, Source};
use crate::types::{DeviceIdentity, DeviceStatusSnapshot};
use crate::{Error, Result};

type EventCallback = Box<dyn Fn(&CoordinatorEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A fetch hit 429; polling continues at `cool_down` until a fetch succeeds.
    RateLimitExceeded {
        plant_id: String,
        device_id: String,
        message: String,
        cool_down: Duration,
    },
    /// Authentication failed for good; polling stops until a forced refresh.
    AuthBroken { device_id: String, message: String },
    /// First successful fetch after a cooldown.
    Recovered,
    /// User-facing alert. Only emitted with `notify_errors` on.
    Notification { title: String, message: String },
    NotificationDismissed,
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollOutcome {
    #[default]
    Completed,
    RateLimited,
    AuthFailed,
}

#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Devices whose snapshot was replaced.
    pub updated: Vec<String>,
    /// Devices skipped because of a device-specific failure, with the reason.
    pub skipped: Vec<(String, String)>,
    /// Devices never fetched because the batch was aborted.
    pub not_polled: Vec<String>,
    /// Devices dropped from the state table as stale before the batch ran.
    pub evicted: Vec<String>,
}

pub struct PollCoordinatorBuilder {
    client: Arc<ApiClient>,
    registry: Arc<DeviceRegistry>,
    state: Arc<DeviceStateTable>,
    options: Options,
    config: Option<ConfigHandle>,
    callbacks: Vec<EventCallback>,
}

impl PollCoordinatorBuilder {
    pub fn new(
        client: Arc<ApiClient>,
        registry: Arc<DeviceRegistry>,
        state: Arc<DeviceStateTable>,
    ) -> Self {
        Self {
            client,
            registry,
            state,
            options: Options::default(),
            config: None,
            callbacks: Vec::new(),
        }
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Persist runtime option changes through `config`.
    pub fn config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn on_event(mut self, f: impl Fn(&CoordinatorEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Box::new(f));
        self
    }

    pub fn build(self) -> PollCoordinator {
        PollCoordinator {
            client: self.client,
            registry: self.registry,
            state: self.state,
            cooldown: Mutex::new(CooldownState::new(
                self.options.normal_interval(),
                self.options.resume_interval(),
            )),
            stale_after: self.options.stale_after(),
            notify_errors: AtomicBool::new(self.options.notify_errors),
            notification_active: AtomicBool::new(false),
            config: self.config,
            callbacks: self.callbacks,
            batch: tokio::sync::Mutex::new(()),
        }
    }
}

/// Scheduled status polling for every registered device.
///
/// A batch fetches devices one after another in registry order. The first
/// account-wide failure (429, or an authentication error) aborts the rest of
/// the batch and stretches the cadence to the cooldown interval; the next
/// successful fetch restores it. Device-specific failures are logged and the
/// batch moves on.
pub struct PollCoordinator {
    client: Arc<ApiClient>,
    registry: Arc<DeviceRegistry>,
    state: Arc<DeviceStateTable>,
    cooldown: Mutex<CooldownState>,
    stale_after: Duration,
    notify_errors: AtomicBool,
    notification_active: AtomicBool,
    config: Option<ConfigHandle>,
    callbacks: Vec<EventCallback>,
    batch: tokio::sync::Mutex<()>,
}

impl PollCoordinator {
    pub fn builder(
        client: Arc<ApiClient>,
        registry: Arc<DeviceRegistry>,
        state: Arc<DeviceStateTable>,
    ) -> PollCoordinatorBuilder {
        PollCoordinatorBuilder::new(client, registry, state)
    }

    pub fn state(&self) -> &Arc<DeviceStateTable> {
        &self.state
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooldown().is_engaged()
    }

    /// Delay before the next scheduled poll.
    pub fn current_interval(&self) -> Duration {
        self.cooldown().active_interval()
    }

    pub fn notify_errors(&self) -> bool {
        self.notify_errors.load(Ordering::Relaxed)
    }

    /// Run one batch. Refuses with [`Error::AuthBroken`] while authentication
    /// is flagged as broken; every other outcome is described by the report.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let _batch = self.batch.lock().await;

        let mut report = PollReport {
            evicted: self.state.prune_older_than(self.stale_after),
            ..PollReport::default()
        };
        for device_id in &report.evicted {
            warn!(device = %device_id, "no fresh data, marking unavailable");
        }

        if self.client.is_auth_broken() {
            error!("authentication is broken, not polling");
            return Err(Error::AuthBroken);
        }

        let devices: Vec<&DeviceIdentity> = self.registry.devices().collect();
        debug!(devices = devices.len(), "poll batch started");

        for (idx, device) in devices.iter().enumerate() {
            if self.client.is_auth_broken() {
                warn!(device = %device.device_id, "authentication broke mid-batch, stopping");
                report.outcome = PollOutcome::AuthFailed;
                report.not_polled = remaining(&devices[idx..]);
                break;
            }

            match self.fetch(device).await {
                Ok(Some(snapshot)) => {
                    debug!(device = %device.device_id, mode = ?snapshot.mode, "status updated");
                    self.state.replace(&device.device_id, snapshot, Source::Poll);
                    report.updated.push(device.device_id.clone());
                }
                Ok(None) => {
                    warn!(device = %device.device_id, "status response carried no thermostat");
                    report
                        .skipped
                        .push((device.device_id.clone(), "empty status response".to_string()));
                }
                Err(e) if e.is_rate_limited() => {
                    self.rate_limited(device, &e);
                    report.outcome = PollOutcome::RateLimited;
                    report.not_polled = remaining(&devices[idx + 1..]);
                    break;
                }
                Err(e) if e.is_auth() => {
                    self.auth_failed(device, &e);
                    report.outcome = PollOutcome::AuthFailed;
                    report.not_polled = remaining(&devices[idx + 1..]);
                    break;
                }
                Err(e) => {
                    warn!(device = %device.device_id, error = %e, "status fetch failed, skipping device");
                    report.skipped.push((device.device_id.clone(), e.to_string()));
                }
            }
        }

        if !report.not_polled.is_empty() {
            warn!(skipped = report.not_polled.len(), outcome = ?report.outcome, "poll batch aborted");
        }
        Ok(report)
    }

    /// Poll, then sleep for the active interval, until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = self.poll_once() => match result {
                    Ok(report) => debug!(
                        updated = report.updated.len(),
                        skipped = report.skipped.len(),
                        outcome = ?report.outcome,
                        "poll batch finished"
                    ),
                    Err(e) => warn!(error = %e, "poll batch refused"),
                },
            }

            let interval = self.current_interval();
            debug!(secs = interval.as_secs(), "next poll scheduled");
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(interval) => {}
            }
        }
        info!("poll loop stopped");
    }

    /// Operator-triggered recovery: exchange the refresh token now and, on
    /// success, lift the broken-auth flag.
    pub async fn force_token_refresh(&self) -> bool {
        if !self.client.tokens().force_refresh().await {
            return false;
        }
        if self.client.is_auth_broken() {
            info!("authentication restored by forced refresh");
            self.client.set_auth_broken(false);
        }
        self.dismiss_notification();
        true
    }

    pub fn set_update_interval(&self, value: u32) -> Result<()> {
        check_minutes("update_interval", value, UPDATE_INTERVAL_RANGE_MIN)?;
        self.cooldown().set_normal_interval(minutes(value));
        info!(minutes = value, "update interval changed");
        self.persist(|o| o.update_interval = value)
    }

    pub fn set_cool_down_interval(&self, value: u32) -> Result<()> {
        check_minutes("cool_down_interval", value, COOL_DOWN_RANGE_MIN)?;
        self.cooldown().set_resume_interval(minutes(value));
        info!(minutes = value, "cool down interval changed");
        self.persist(|o| o.cool_down_interval = value)
    }

    pub fn set_notify_errors(&self, enabled: bool) -> Result<()> {
        self.notify_errors.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.dismiss_notification();
        }
        self.persist(|o| o.notify_errors = enabled)
    }

    async fn fetch(&self, device: &DeviceIdentity) -> Result<Option<DeviceStatusSnapshot>> {
        let resp = self
            .client
            .get(&status_path(&device.plant_id, &device.device_id))
            .await?;
        // Any accepted call ends cooldown, whatever the payload.
        self.fetch_succeeded();
        parse_status_response(&resp.data)
    }

    fn fetch_succeeded(&self) {
        if self.cooldown().disengage() {
            info!("fetch succeeded, leaving cooldown");
            self.emit(&CoordinatorEvent::Recovered);
            self.dismiss_notification();
        }
    }

    fn rate_limited(&self, device: &DeviceIdentity, e: &Error) {
        let cool_down = {
            let mut cooldown = self.cooldown();
            cooldown.engage();
            cooldown.active_interval()
        };
        error!(
            device = %device.device_id,
            cool_down_secs = cool_down.as_secs(),
            "rate limited, entering cooldown"
        );
        self.emit(&CoordinatorEvent::RateLimitExceeded {
            plant_id: device.plant_id.clone(),
            device_id: device.device_id.clone(),
            message: e.to_string(),
            cool_down,
        });
        self.notify(
            "BTicino rate limit exceeded",
            format!(
                "Too many requests. Polling paused for {} minutes.",
                cool_down.as_secs() / 60
            ),
        );
    }

    fn auth_failed(&self, device: &DeviceIdentity, e: &Error) {
        self.client.set_auth_broken(true);
        self.cooldown().engage();
        error!(device = %device.device_id, error = %e, "authentication failed, polling stopped");
        self.emit(&CoordinatorEvent::AuthBroken {
            device_id: device.device_id.clone(),
            message: e.to_string(),
        });
        self.notify(
            "BTicino authentication failed",
            "The access token could not be refreshed. Reauthorise the integration or force a token refresh."
                .to_string(),
        );
    }

    fn notify(&self, title: &str, message: String) {
        if !self.notify_errors() {
            return;
        }
        self.notification_active.store(true, Ordering::Relaxed);
        self.emit(&CoordinatorEvent::Notification {
            title: title.to_string(),
            message,
        });
    }

    fn dismiss_notification(&self) {
        if self.notification_active.swap(false, Ordering::Relaxed) {
            self.emit(&CoordinatorEvent::NotificationDismissed);
        }
    }

    fn emit(&self, event: &CoordinatorEvent) {
        for cb in &self.callbacks {
            cb(event);
        }
    }

    fn persist(&self, f: impl FnOnce(&mut Options)) -> Result<()> {
        match self.config {
            Some(ref config) => config.update(|stored| f(&mut stored.options)),
            None => Ok(()),
        }
    }

    fn cooldown(&self) -> std::sync::MutexGuard<'_, CooldownState> {
        self.cooldown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remaining(devices: &[&DeviceIdentity]) -> Vec<String> {
    devices.iter().map(|d| d.device_id.clone()).collect()
}
