use chrono::{DateTime, NaiveDateTime, TimeDelta};
use serde_json::{json, Value};

use crate::types::*;
use crate::{Error, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://api.developer.legrand.com";
pub const DEFAULT_AUTH_BASE_URL: &str = "https://partners-login.eliotbylegrand.com";
pub const TOKEN_PATH: &str = "/token";
pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Path segment the host exposes webhooks under; used to recognise our own
/// subscriptions among everything registered on the account.
pub const WEBHOOK_PATH: &str = "/api/webhook/";

const API_PREFIX: &str = "/smarther/v2.0";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const SET_POINT_UNIT: &str = "C";
const DEFAULT_MANUAL_SET_POINT: f64 = 20.0;

pub const BOOST_HEATING_SET_POINT: f64 = 40.0;
pub const BOOST_COOLING_SET_POINT: f64 = 7.0;

pub fn plants_path() -> String {
    format!("{API_PREFIX}/plants")
}

pub fn topology_path(plant_id: &str) -> String {
    format!("{API_PREFIX}/plants/{plant_id}/topology")
}

pub fn status_path(plant_id: &str, module_id: &str) -> String {
    format!(
        "{API_PREFIX}/chronothermostat/thermoregulation/addressLocation/plants/{plant_id}/modules/parameter/id/value/{module_id}"
    )
}

pub fn program_list_path(plant_id: &str, module_id: &str) -> String {
    format!("{}/programlist", status_path(plant_id, module_id))
}

pub fn subscriptions_path() -> String {
    format!("{API_PREFIX}/subscription")
}

pub fn plant_subscription_path(plant_id: &str) -> String {
    format!("{API_PREFIX}/plants/{plant_id}/subscription")
}

pub fn subscription_path(plant_id: &str, subscription_id: &str) -> String {
    format!("{API_PREFIX}/plants/{plant_id}/subscription/{subscription_id}")
}

// -- Command payloads --

pub fn manual_data(function: Function, set_point: f64) -> Value {
    json!({
        "function": function.as_x8000_str(),
        "mode": Mode::Manual.as_x8000_str(),
        "setPoint": { "value": set_point, "unit": SET_POINT_UNIT }
    })
}

pub fn automatic_data(function: Function, program: u32) -> Value {
    json!({
        "function": function.as_x8000_str(),
        "mode": Mode::Automatic.as_x8000_str(),
        "programs": [{ "number": program }]
    })
}

pub fn off_data(function: Function) -> Value {
    json!({
        "function": function.as_x8000_str(),
        "mode": Mode::Off.as_x8000_str()
    })
}

/// Heat/cool requests switch to manual at the current set point, or 20°C
/// when none is known.
pub fn hvac_mode_data(mode: HvacMode, current: Function, set_point: Option<f64>, program: u32) -> Value {
    match mode {
        HvacMode::Auto => automatic_data(current, program),
        HvacMode::Off => off_data(current),
        HvacMode::Heat => manual_data(Function::Heating, set_point.unwrap_or(DEFAULT_MANUAL_SET_POINT)),
        HvacMode::Cool => manual_data(Function::Cooling, set_point.unwrap_or(DEFAULT_MANUAL_SET_POINT)),
    }
}

/// Boost drives the set point to the end of the range for the active function
/// and carries an explicit `start/end` activation window.
pub fn boost_data(function: Function, start: NaiveDateTime, minutes: u32) -> Value {
    let end = start + TimeDelta::minutes(i64::from(minutes));
    let set_point = match function {
        Function::Heating => BOOST_HEATING_SET_POINT,
        Function::Cooling => BOOST_COOLING_SET_POINT,
    };
    json!({
        "function": function.as_x8000_str(),
        "mode": Mode::Boost.as_x8000_str(),
        "activationTime": format!(
            "{}/{}",
            start.format(TIMESTAMP_FORMAT),
            end.format(TIMESTAMP_FORMAT)
        ),
        "setPoint": { "value": set_point, "unit": SET_POINT_UNIT }
    })
}

// -- Status parsing --

/// The `chronothermostats` member of `container`, normalised to a list.
/// `None` when the member is absent; a single object is wrapped.
pub fn chronothermostat_list(container: &Value) -> Option<Vec<Value>> {
    match container.get("chronothermostats")? {
        Value::Array(items) => Some(items.clone()),
        obj @ Value::Object(_) => Some(vec![obj.clone()]),
        _ => Some(Vec::new()),
    }
}

/// Device id of a pushed or polled status object: the module id under
/// `sender`, falling back to the older `receiver.oid` location.
pub fn device_id_of(chrono: &Value) -> Option<&str> {
    chrono
        .pointer("/sender/plant/module/id")
        .and_then(|v| v.as_str())
        .or_else(|| chrono.pointer("/receiver/oid").and_then(|v| v.as_str()))
}

/// Parse the body of a status GET. `Ok(None)` when the upstream returned no
/// thermostat for the module.
pub fn parse_status_response(data: &Value) -> Result<Option<DeviceStatusSnapshot>> {
    let list = chronothermostat_list(data)
        .ok_or_else(|| Error::Decode("status response has no chronothermostats".to_string()))?;
    match list.first() {
        Some(chrono) => parse_snapshot(chrono).map(Some),
        None => Ok(None),
    }
}

pub fn parse_snapshot(chrono: &Value) -> Result<DeviceStatusSnapshot> {
    if !chrono.is_object() {
        return Err(Error::Decode("status entry is not an object".to_string()));
    }

    let function = chrono
        .get("function")
        .and_then(|v| v.as_str())
        .and_then(Function::from_x8000_str)
        .ok_or_else(|| Error::Decode(format!("missing or unknown function: {}", chrono.get("function").unwrap_or(&Value::Null))))?;

    let mode = chrono
        .get("mode")
        .and_then(|v| v.as_str())
        .and_then(Mode::from_x8000_str)
        .ok_or_else(|| Error::Decode(format!("missing or unknown mode: {}", chrono.get("mode").unwrap_or(&Value::Null))))?;

    let load_state = chrono
        .get("loadState")
        .and_then(|v| v.as_str())
        .and_then(LoadState::from_x8000_str)
        .unwrap_or_default();

    let program = chrono
        .pointer("/programs/0/number")
        .and_then(as_program_number);

    let boost = if mode == Mode::Boost {
        chrono
            .get("activationTime")
            .and_then(|v| v.as_str())
            .and_then(parse_activation_time)
    } else {
        None
    };

    Ok(DeviceStatusSnapshot {
        function,
        mode,
        load_state,
        set_point: chrono.pointer("/setPoint/value").and_then(as_number),
        temperature: chrono.pointer("/thermometer/measures/0/value").and_then(as_number),
        humidity: chrono.pointer("/hygrometer/measures/0/value").and_then(as_number),
        program,
        boost,
    })
}

/// `start/end` or just `end`.
pub fn parse_activation_time(raw: &str) -> Option<BoostWindow> {
    match raw.split_once('/') {
        Some((start, end)) => Some(BoostWindow {
            start: Some(parse_timestamp(start)?),
            end: parse_timestamp(end)?,
        }),
        None => Some(BoostWindow {
            start: None,
            end: parse_timestamp(raw)?,
        }),
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// The upstream sends measures both as JSON numbers and as numeric strings.
fn as_program_number(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
