use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{check_debounce, ConfigHandle};
use crate::protocol::{chronothermostat_list, device_id_of, parse_snapshot};
use crate::registry::DeviceRegistry;
use crate::state::{DeviceStateTable, Source};
use crate::Result;

/// One known way the upstream nests status objects in a push body.
struct Envelope {
    name: &'static str,
    extract: fn(&Value) -> Option<Vec<Value>>,
}

/// Tried in order; the first that structurally matches wins.
const ENVELOPES: &[Envelope] = &[
    Envelope {
        name: "data.chronothermostats",
        extract: nested_data,
    },
    Envelope {
        name: "chronothermostats",
        extract: chronothermostat_list,
    },
    Envelope {
        name: "event list",
        extract: event_list,
    },
];

fn nested_data(body: &Value) -> Option<Vec<Value>> {
    chronothermostat_list(body.get("data")?)
}

/// `[{"data": {"chronothermostats": [...]}}, ...]`, optionally wrapped in
/// `{"data": [...]}` by the host transport.
fn event_list(body: &Value) -> Option<Vec<Value>> {
    let events = match body {
        Value::Array(events) => events,
        Value::Object(_) => body.get("data")?.as_array()?,
        _ => return None,
    };
    let mut out = Vec::new();
    let mut matched = false;
    for event in events {
        if let Some(list) = event.get("data").and_then(chronothermostat_list) {
            matched = true;
            out.extend(list);
        }
    }
    matched.then_some(out)
}

/// Status objects carried by `body`, with the name of the envelope that
/// matched. Unknown shapes yield `None`.
pub fn extract_status_objects(body: &Value) -> Option<(&'static str, Vec<Value>)> {
    ENVELOPES
        .iter()
        .find_map(|env| (env.extract)(body).map(|list| (env.name, list)))
}

/// What the host's HTTP handler should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookReply {
    pub status: u16,
    pub updated: usize,
}

struct Debounce {
    window: Duration,
    last_accepted: Option<Instant>,
}

/// Applies pushed status notifications to the state table. Never calls the
/// upstream.
pub struct WebhookMerger {
    registry: Arc<DeviceRegistry>,
    state: Arc<DeviceStateTable>,
    debounce: Mutex<Debounce>,
    config: Option<ConfigHandle>,
}

impl WebhookMerger {
    pub fn new(registry: Arc<DeviceRegistry>, state: Arc<DeviceStateTable>, debounce: Duration) -> Self {
        Self {
            registry,
            state,
            debounce: Mutex::new(Debounce {
                window: debounce,
                last_accepted: None,
            }),
            config: None,
        }
    }

    /// Persist debounce changes through `config`.
    pub fn with_persistence(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn debounce_window(&self) -> Duration {
        self.debounce.lock().unwrap_or_else(PoisonError::into_inner).window
    }

    pub fn set_debounce(&self, seconds: f64) -> Result<()> {
        check_debounce(seconds)?;
        self.debounce.lock().unwrap_or_else(PoisonError::into_inner).window =
            Duration::from_secs_f64(seconds);
        info!(seconds, "webhook debounce changed");
        match self.config {
            Some(ref config) => config.update(|stored| stored.options.webhook_debounce = seconds),
            None => Ok(()),
        }
    }

    /// Apply one push body. Returns how many devices were updated; anything
    /// malformed, debounced or unmonitored counts as zero.
    pub fn ingest(&self, body: &Value) -> usize {
        if !self.accept_now() {
            debug!("webhook dropped by debounce");
            return 0;
        }

        let Some((envelope, objects)) = extract_status_objects(body) else {
            warn!("webhook body has no known envelope, ignoring");
            return 0;
        };
        debug!(envelope, objects = objects.len(), "webhook envelope matched");

        let mut updated = 0;
        for object in &objects {
            let Some(device_id) = device_id_of(object) else {
                debug!("status object without device id");
                continue;
            };
            if !self.registry.contains(device_id) {
                debug!(device = %device_id, "ignoring webhook for unmonitored device");
                continue;
            }
            match parse_snapshot(object) {
                Ok(snapshot) => {
                    self.state.replace(device_id, snapshot, Source::Webhook);
                    updated += 1;
                    debug!(device = %device_id, "status updated via webhook");
                }
                Err(e) => warn!(device = %device_id, error = %e, "malformed webhook status"),
            }
        }

        if updated > 0 {
            info!(updated, "webhook applied");
        }
        updated
    }

    /// Parse and apply a raw request body. Unparseable JSON answers 400 and
    /// leaves the debounce window untouched; anything parseable answers 200.
    pub fn handle_body(&self, raw: &[u8]) -> WebhookReply {
        match serde_json::from_slice::<Value>(raw) {
            Ok(body) => WebhookReply {
                status: 200,
                updated: self.ingest(&body),
            },
            Err(e) => {
                warn!(error = %e, "webhook body is not JSON");
                WebhookReply {
                    status: 400,
                    updated: 0,
                }
            }
        }
    }

    fn accept_now(&self) -> bool {
        let mut debounce = self.debounce.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(last) = debounce.last_accepted
            && now.duration_since(last) < debounce.window
        {
            return false;
        }
        debounce.last_accepted = Some(now);
        true
    }
}
