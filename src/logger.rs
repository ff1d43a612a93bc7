use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

/// How much of each upstream exchange goes into the traffic log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Request bodies are included.
    Full,
    /// Method, path, attempt and outcome only.
    Compact,
}

/// NDJSON log of every physical upstream attempt and every dispatched command.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { mode, file })
    }

    /// `status` is `None` when the attempt failed at the transport level.
    pub fn log_attempt(
        &mut self,
        method: &str,
        path: &str,
        attempt: u32,
        status: Option<u16>,
        body: Option<&Value>,
    ) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "method": method,
            "path": path,
            "attempt": attempt,
            "status": status,
        });
        if self.mode == MessageLogMode::Full
            && let (Some(body), Some(obj)) = (body, entry.as_object_mut())
        {
            obj.insert("body".to_string(), body.clone());
        }
        self.write_line(&entry);
    }

    pub fn log_command(&mut self, action: &str, device: &str, body: &Value) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "action": action,
            "device": device,
        });
        if self.mode == MessageLogMode::Full
            && let Some(obj) = entry.as_object_mut()
        {
            obj.insert("body".to_string(), body.clone());
        }
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}
