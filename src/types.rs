use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Function {
    #[default]
    Heating,
    Cooling,
}

impl Function {
    pub fn as_x8000_str(&self) -> &'static str {
        match self {
            Function::Heating => "heating",
            Function::Cooling => "cooling",
        }
    }

    pub fn from_x8000_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "heating" => Some(Function::Heating),
            "cooling" => Some(Function::Cooling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Automatic,
    Manual,
    Boost,
    Protection,
    Off,
}

impl Mode {
    pub fn as_x8000_str(&self) -> &'static str {
        match self {
            Mode::Automatic => "automatic",
            Mode::Manual => "manual",
            Mode::Boost => "boost",
            Mode::Protection => "protection",
            Mode::Off => "off",
        }
    }

    pub fn from_x8000_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" => Some(Mode::Automatic),
            "manual" => Some(Mode::Manual),
            "boost" => Some(Mode::Boost),
            "protection" => Some(Mode::Protection),
            "off" => Some(Mode::Off),
            _ => None,
        }
    }

    /// Protection is the device's frost/antifreeze state and counts as off.
    pub fn is_off(&self) -> bool {
        matches!(self, Mode::Off | Mode::Protection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    Active,
    #[default]
    Inactive,
}

impl LoadState {
    pub fn from_x8000_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(LoadState::Active),
            "inactive" => Some(LoadState::Inactive),
            _ => None,
        }
    }
}

/// What the device is doing right now, derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacAction {
    Heating,
    Cooling,
    Idle,
    Off,
}

/// User-facing operating mode, used both for presentation and for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacMode {
    Heat,
    Cool,
    Auto,
    Off,
}

/// Boost activation window in device-local wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoostWindow {
    pub start: Option<NaiveDateTime>,
    pub end: NaiveDateTime,
}

impl BoostWindow {
    pub fn duration_minutes(&self) -> Option<i64> {
        self.start.map(|start| (self.end - start).num_minutes())
    }

    /// Minutes left at `now`, rounded with 30s of tolerance for clock skew
    /// between the upstream and the local host. Never negative.
    pub fn remaining_minutes(&self, now: NaiveDateTime) -> i64 {
        let remaining = self.end - now + TimeDelta::seconds(30);
        remaining.num_minutes().max(0)
    }
}

/// Complete point-in-time status of one thermostat.
///
/// Measurements are optional because push and poll payloads differ in
/// completeness; a missing value is reported as missing, never carried over
/// from an earlier snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatusSnapshot {
    pub function: Function,
    pub mode: Mode,
    pub load_state: LoadState,
    pub set_point: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub program: Option<u32>,
    pub boost: Option<BoostWindow>,
}

impl DeviceStatusSnapshot {
    pub fn action(&self) -> HvacAction {
        match (self.load_state, self.function) {
            (LoadState::Active, Function::Heating) => HvacAction::Heating,
            (LoadState::Active, Function::Cooling) => HvacAction::Cooling,
            (LoadState::Inactive, _) if self.mode.is_off() => HvacAction::Off,
            (LoadState::Inactive, _) => HvacAction::Idle,
        }
    }

    pub fn hvac_mode(&self) -> HvacMode {
        match self.mode {
            Mode::Automatic => HvacMode::Auto,
            Mode::Off | Mode::Protection => HvacMode::Off,
            Mode::Manual | Mode::Boost => match self.function {
                Function::Heating => HvacMode::Heat,
                Function::Cooling => HvacMode::Cool,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub number: u32,
    pub name: String,
}

/// A thermostat the user selected for management. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub plant_id: String,
    pub device_id: String,
    pub display_name: String,
    pub programs: Vec<Program>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandIntent {
    SetTemperature(f64),
    SetMode(HvacMode),
    SetProgram(u32),
    /// Boost for the given number of minutes.
    SetBoost(u32),
    /// Leave boost and return to the automatic program.
    CancelBoost,
}
