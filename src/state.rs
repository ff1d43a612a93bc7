use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::types::DeviceStatusSnapshot;

/// Which path wrote a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Poll,
    Webhook,
}

#[derive(Debug, Clone)]
pub struct StateEntry {
    pub snapshot: Arc<DeviceStatusSnapshot>,
    pub source: Source,
    pub received_at: DateTime<Utc>,
    received: Instant,
}

impl StateEntry {
    pub fn age(&self) -> Duration {
        self.received.elapsed()
    }
}

/// Latest snapshot per device id. Writes always replace the whole entry; a
/// device with no entry is unavailable.
#[derive(Debug, Default)]
pub struct DeviceStateTable {
    entries: RwLock<HashMap<String, StateEntry>>,
}

impl DeviceStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, device_id: &str, snapshot: DeviceStatusSnapshot, source: Source) {
        let entry = StateEntry {
            snapshot: Arc::new(snapshot),
            source,
            received_at: Utc::now(),
            received: Instant::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), entry);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceStatusSnapshot>> {
        self.entry(device_id).map(|e| e.snapshot)
    }

    pub fn entry(&self, device_id: &str) -> Option<StateEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceStatusSnapshot>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id)
            .map(|e| e.snapshot)
    }

    /// Drop every entry older than `max_age`; returns the evicted device ids.
    pub fn prune_older_than(&self, max_age: Duration) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.age() > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
