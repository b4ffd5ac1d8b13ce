use crate::device::handle::DeviceHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for devices
pub type DeviceId = u32;

/// Electrical pin number (BCM numbering)
pub type PinNo = u8;

/// Logical level of a pin as seen by the controller
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PinState {
    High,
    Low,
    /// Handle not yet materialized, or faulted
    Undefined,
}

/// Role of a device in the rig
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Pump,
    Valve,
}

/// Durable description of a device, as stored by the repository
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub pin_no: PinNo,
    pub kind: DeviceKind,
}

/// Input for creating a device
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub name: String,
    pub pin_no: PinNo,
    pub kind: DeviceKind,
}

/// Input for creating a valve
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewValve {
    pub name: String,
    pub pin_no: PinNo,
}

/// Input for renaming or re-pinning a valve
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValveUpdate {
    pub id: DeviceId,
    pub name: String,
    pub pin_no: PinNo,
}

/// Client-facing summary of a device including its live state
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: DeviceId,
    pub name: String,
    pub pin_no: PinNo,
    pub kind: DeviceKind,
    pub state: PinState,
}

/// Live state of a single valve
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValveState {
    pub id: DeviceId,
    pub name: String,
    pub state: PinState,
}

/// Live state of a pin
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PinReading {
    pub pin_no: PinNo,
    pub state: PinState,
}

/// Outcome of commanding one device: what was requested and what was read back
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    pub id: DeviceId,
    pub name: String,
    pub pin_no: PinNo,
    pub requested: PinState,
    pub actual: PinState,
}

/// A device owned by the rig: its record plus the handle driving it
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub pin_no: PinNo,
    pub kind: DeviceKind,
    handle: Box<dyn DeviceHandle>,
}

impl PinState {
    pub fn from_level(level: bool) -> Self {
        if level { PinState::High } else { PinState::Low }
    }

    /// Electrical level for a commandable state, `None` for `Undefined`
    pub fn level(self) -> Option<bool> {
        match self {
            PinState::High => Some(true),
            PinState::Low => Some(false),
            PinState::Undefined => None,
        }
    }
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinState::High => write!(f, "HIGH"),
            PinState::Low => write!(f, "LOW"),
            PinState::Undefined => write!(f, "UNDEFINED"),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Pump => write!(f, "PUMP"),
            DeviceKind::Valve => write!(f, "VALVE"),
        }
    }
}

impl DeviceReport {
    pub fn is_ok(&self) -> bool {
        self.requested == self.actual
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pin {}): expected {}, read {}",
            self.name, self.pin_no, self.requested, self.actual
        )
    }
}

impl Device {
    pub fn new(record: DeviceRecord, handle: Box<dyn DeviceHandle>) -> Self {
        Self {
            id: record.id,
            name: record.name,
            pin_no: record.pin_no,
            kind: record.kind,
            handle,
        }
    }

    pub fn is_pump(&self) -> bool {
        self.kind == DeviceKind::Pump
    }

    pub fn is_valve(&self) -> bool {
        self.kind == DeviceKind::Valve
    }

    pub fn state(&self) -> PinState {
        self.handle.get_state()
    }

    /// Write `state` and read it back. A mismatch is reported, never retried.
    pub fn command(&mut self, state: PinState) -> DeviceReport {
        self.handle.set_state(state);
        let actual = self.handle.get_state();
        DeviceReport {
            id: self.id,
            name: self.name.clone(),
            pin_no: self.pin_no,
            requested: state,
            actual,
        }
    }

    /// Replace the handle with one bound to a new pin; the old handle is released first.
    pub fn rebind(&mut self, pin_no: PinNo, handle: Box<dyn DeviceHandle>) {
        self.handle.destroy();
        self.pin_no = pin_no;
        self.handle = handle;
    }

    pub fn release(&mut self) {
        self.handle.destroy();
    }

    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id,
            name: self.name.clone(),
            pin_no: self.pin_no,
            kind: self.kind,
        }
    }

    pub fn view(&self) -> DeviceView {
        DeviceView {
            id: self.id,
            name: self.name.clone(),
            pin_no: self.pin_no,
            kind: self.kind,
            state: self.state(),
        }
    }
}
