//! Account discovery: plants, thermostat modules and their program catalogs.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::config::SelectedThermostat;
use crate::protocol::{chronothermostat_list, plants_path, program_list_path, topology_path};
use crate::types::Program;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlantSummary {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub id: String,
    pub name: String,
}

pub async fn list_plants(client: &ApiClient) -> Result<Vec<PlantSummary>> {
    let resp = client.get(&plants_path()).await?;
    let mut plants: Vec<PlantSummary> = Vec::new();
    for plant in parse_plants(&resp.data) {
        if !plants.iter().any(|p| p.id == plant.id) {
            plants.push(plant);
        }
    }
    debug!(count = plants.len(), "plants listed");
    Ok(plants)
}

pub async fn list_modules(client: &ApiClient, plant_id: &str) -> Result<Vec<ModuleSummary>> {
    let resp = client.get(&topology_path(plant_id)).await?;
    Ok(parse_modules(&resp.data))
}

pub async fn list_programs(client: &ApiClient, plant_id: &str, module_id: &str) -> Result<Vec<Program>> {
    let resp = client.get(&program_list_path(plant_id, module_id)).await?;
    Ok(parse_programs(&resp.data))
}

/// Every thermostat on the account, ready to be stored as a selection. Each
/// gets a fresh webhook id. A module whose program list cannot be fetched is
/// kept with an empty catalog unless the failure affects the whole account.
pub async fn discover_thermostats(client: &ApiClient) -> Result<Vec<SelectedThermostat>> {
    let mut found = Vec::new();
    for plant in list_plants(client).await? {
        let modules = match list_modules(client, &plant.id).await {
            Ok(modules) => modules,
            Err(e) if e.is_account_wide() => return Err(e),
            Err(e) => {
                warn!(plant = %plant.id, error = %e, "topology unavailable, skipping plant");
                continue;
            }
        };
        for module in modules {
            let programs = match list_programs(client, &plant.id, &module.id).await {
                Ok(programs) => programs,
                Err(e) if e.is_account_wide() => return Err(e),
                Err(e) => {
                    warn!(module = %module.id, error = %e, "program list unavailable");
                    Vec::new()
                }
            };
            found.push(SelectedThermostat {
                plant_id: plant.id.clone(),
                id: module.id,
                name: module.name,
                programs,
                webhook_id: Uuid::new_v4().simple().to_string(),
                subscription_id: None,
            });
        }
    }
    Ok(found)
}

/// `{"plants": [...]}` or a bare list.
pub(crate) fn parse_plants(data: &Value) -> Vec<PlantSummary> {
    let list = match data {
        Value::Array(items) => items.as_slice(),
        _ => match data.get("plants").and_then(|p| p.as_array()) {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
    };
    list.iter()
        .filter_map(|p| {
            Some(PlantSummary {
                id: p.get("id")?.as_str()?.to_string(),
                name: p.get("name").and_then(|n| n.as_str()).map(str::to_string),
            })
        })
        .collect()
}

/// `{"plant": {"modules": [...]}}`, `{"modules": [...]}` or a bare list.
pub(crate) fn parse_modules(data: &Value) -> Vec<ModuleSummary> {
    let modules = data
        .pointer("/plant/modules")
        .or_else(|| data.get("modules"))
        .unwrap_or(data);
    let Some(modules) = modules.as_array() else {
        return Vec::new();
    };
    modules
        .iter()
        .filter_map(|m| {
            Some(ModuleSummary {
                id: m.get("id")?.as_str()?.to_string(),
                name: m
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
            })
        })
        .collect()
}

/// Programs of the first thermostat in the response. Program 0 is the
/// device's internal placeholder and is dropped.
pub(crate) fn parse_programs(data: &Value) -> Vec<Program> {
    let first = match chronothermostat_list(data) {
        Some(list) => list.into_iter().next(),
        None => data.as_array().and_then(|a| a.first().cloned()),
    };
    let Some(programs) = first.as_ref().and_then(|c| c.get("programs")).and_then(|p| p.as_array()) else {
        return Vec::new();
    };
    programs
        .iter()
        .filter_map(|p| {
            let number = p.get("number")?.as_u64()?;
            Some(Program {
                number: u32::try_from(number).ok()?,
                name: p
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Program {number}")),
            })
        })
        .filter(|p| p.number != 0)
        .collect()
}
