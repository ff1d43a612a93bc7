use std::sync::Arc;

use chrono::Local;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{ApiClient, ApiResponse};
use crate::protocol::{automatic_data, boost_data, hvac_mode_data, manual_data, status_path};
use crate::registry::DeviceRegistry;
use crate::state::DeviceStateTable;
use crate::types::{CommandIntent, DeviceIdentity, Function};
use crate::{Error, Result};

/// Fallback when neither the device nor its catalog names a program.
const DEFAULT_PROGRAM: u32 = 1;

/// Translates user commands into upstream status writes.
///
/// Fields the command does not change (function, active program, set point)
/// come from the device's current snapshot. The state table is only read:
/// the next poll or webhook reports the result.
pub struct CommandDispatcher {
    client: Arc<ApiClient>,
    registry: Arc<DeviceRegistry>,
    state: Arc<DeviceStateTable>,
}

impl CommandDispatcher {
    pub fn new(client: Arc<ApiClient>, registry: Arc<DeviceRegistry>, state: Arc<DeviceStateTable>) -> Self {
        Self {
            client,
            registry,
            state,
        }
    }

    pub async fn apply(&self, device_id: &str, intent: CommandIntent) -> Result<ApiResponse> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;

        let body = self.payload(device, intent)?;
        let action = action_name(intent);
        info!(device = %device_id, action, "sending command");
        debug!(device = %device_id, body = %body, "command payload");
        self.client.log_command(action, device_id, &body);

        self.client
            .post(&status_path(&device.plant_id, &device.device_id), &body)
            .await
    }

    /// The upstream body for `intent`, filled in from the current snapshot.
    pub fn payload(&self, device: &DeviceIdentity, intent: CommandIntent) -> Result<Value> {
        let current = self.state.get(&device.device_id);
        let function = current.as_ref().map(|s| s.function).unwrap_or(Function::Heating);
        let set_point = current.as_ref().and_then(|s| s.set_point);
        let program = current
            .as_ref()
            .and_then(|s| s.program)
            .or_else(|| device.programs.first().map(|p| p.number))
            .unwrap_or(DEFAULT_PROGRAM);

        Ok(match intent {
            CommandIntent::SetTemperature(value) => manual_data(function, value),
            CommandIntent::SetMode(mode) => hvac_mode_data(mode, function, set_point, program),
            CommandIntent::SetProgram(number) => {
                if !device.programs.is_empty() && !device.programs.iter().any(|p| p.number == number) {
                    return Err(Error::UnknownProgram(number));
                }
                automatic_data(function, number)
            }
            CommandIntent::SetBoost(minutes) => boost_data(function, Local::now().naive_local(), minutes),
            CommandIntent::CancelBoost => automatic_data(function, program),
        })
    }
}

fn action_name(intent: CommandIntent) -> &'static str {
    match intent {
        CommandIntent::SetTemperature(_) => "set_temperature",
        CommandIntent::SetMode(_) => "set_mode",
        CommandIntent::SetProgram(_) => "set_program",
        CommandIntent::SetBoost(_) => "set_boost",
        CommandIntent::CancelBoost => "cancel_boost",
    }
}
