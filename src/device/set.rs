use crate::device::types::{Device, DeviceId, DeviceKind, PinNo, PinState};
use std::collections::BTreeMap;

/// The rig's device collection: every valve and at most one pump
#[derive(Debug, Default)]
pub struct DeviceSet {
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn insert(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.id, device)
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        self.devices.remove(&id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    pub fn pump(&self) -> Option<&Device> {
        self.devices.values().find(|d| d.kind == DeviceKind::Pump)
    }

    pub fn pump_mut(&mut self) -> Option<&mut Device> {
        self.devices.values_mut().find(|d| d.kind == DeviceKind::Pump)
    }

    pub fn valves(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.kind == DeviceKind::Valve)
    }

    pub fn valve_ids(&self) -> Vec<DeviceId> {
        self.valves().map(|d| d.id).collect()
    }

    pub fn valve(&self, id: DeviceId) -> Option<&Device> {
        self.get(id).filter(|d| d.is_valve())
    }

    pub fn by_pin(&self, pin: PinNo) -> Option<&Device> {
        self.devices.values().find(|d| d.pin_no == pin)
    }

    /// Whether another device than `except` already uses `name`
    pub fn name_taken(&self, name: &str, except: Option<DeviceId>) -> bool {
        self.devices
            .values()
            .any(|d| d.name == name && Some(d.id) != except)
    }

    /// Count of HIGH valves across the whole rig, ignoring `excluded`
    pub fn open_valves_outside(&self, excluded: &[DeviceId]) -> usize {
        self.valves()
            .filter(|v| !excluded.contains(&v.id))
            .filter(|v| v.state() == PinState::High)
            .count()
    }

    pub fn any_valve_open(&self) -> bool {
        self.open_valves_outside(&[]) > 0
    }

    /// Release every handle. Used on shutdown.
    pub fn release_all(&mut self) {
        for device in self.devices.values_mut() {
            device.release();
        }
    }
}
