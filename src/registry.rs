use crate::config::SelectedThermostat;
use crate::types::DeviceIdentity;

/// Plants and the thermostats selected under each, in configuration order.
/// Built once at load and never mutated.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    plants: Vec<(String, Vec<DeviceIdentity>)>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        let mut plants: Vec<(String, Vec<DeviceIdentity>)> = Vec::new();
        for device in devices {
            if plants.iter().flat_map(|(_, d)| d).any(|d| d.device_id == device.device_id) {
                continue;
            }
            match plants.iter_mut().find(|(plant, _)| *plant == device.plant_id) {
                Some((_, list)) => list.push(device),
                None => plants.push((device.plant_id.clone(), vec![device])),
            }
        }
        Self { plants }
    }

    pub fn from_selection(selected: &[SelectedThermostat]) -> Self {
        Self::new(selected.iter().map(|t| DeviceIdentity {
            plant_id: t.plant_id.clone(),
            device_id: t.id.clone(),
            display_name: t.name.clone(),
            programs: t.programs.clone(),
        }))
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceIdentity> {
        self.devices().find(|d| d.device_id == device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    /// All devices, grouped by plant, in configuration order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.plants.iter().flat_map(|(_, devices)| devices.iter())
    }

    pub fn plants(&self) -> impl Iterator<Item = (&str, &[DeviceIdentity])> {
        self.plants.iter().map(|(p, d)| (p.as_str(), d.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.plants.iter().map(|(_, d)| d.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
