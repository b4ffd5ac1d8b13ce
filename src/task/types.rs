use crate::device::{DeviceId, DeviceSet, DeviceView};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for tasks
pub type TaskId = u32;

/// Recurrence class of a task
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Period {
    #[default]
    Everyday,
}

/// Durable description of a task, as stored by the repository
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub stop: NaiveTime,
    pub period: Period,
    pub is_active: bool,
    /// Valve summaries in assignment order
    #[serde(default)]
    pub devices: Vec<TaskDevice>,
}

/// Valve summary embedded in a task record
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDevice {
    pub id: DeviceId,
    pub name: String,
    pub pin_no: crate::device::PinNo,
}

/// Input for creating a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub stop: NaiveTime,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub is_active: bool,
    /// Valves to attach on creation
    #[serde(default)]
    pub device_ids: Vec<DeviceId>,
}

/// Input for changing a task's schedule; valves are changed by assign/unassign
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub id: TaskId,
    pub name: String,
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub stop: NaiveTime,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub is_active: bool,
}

/// A task as held by the manager. Devices are ids into the shared [`DeviceSet`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrrigationTask {
    pub id: TaskId,
    pub name: String,
    pub start: NaiveTime,
    pub stop: NaiveTime,
    pub period: Period,
    pub is_active: bool,
    pub devices: Vec<DeviceId>,
}

/// Client-facing task with resolved device summaries
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub stop: NaiveTime,
    pub period: Period,
    pub is_active: bool,
    pub devices: Vec<DeviceView>,
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Everyday => write!(f, "EVERYDAY"),
        }
    }
}

impl IrrigationTask {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            start: record.start,
            stop: record.stop,
            period: record.period,
            is_active: record.is_active,
            devices: record.devices.iter().map(|d| d.id).collect(),
        }
    }

    pub fn apply(&mut self, update: &TaskUpdate) {
        self.name = update.name.clone();
        self.start = update.start;
        self.stop = update.stop;
        self.period = update.period;
        self.is_active = update.is_active;
    }

    /// Whether `update` would leave the task exactly as it is
    pub fn matches(&self, update: &TaskUpdate) -> bool {
        self.name == update.name
            && self.start == update.start
            && self.stop == update.stop
            && self.period == update.period
            && self.is_active == update.is_active
    }

    pub fn has_device(&self, id: DeviceId) -> bool {
        self.devices.contains(&id)
    }

    /// Resolve against the live device set. Ids missing from the set are skipped.
    pub fn view(&self, devices: &DeviceSet) -> TaskView {
        TaskView {
            id: self.id,
            name: self.name.clone(),
            start: self.start,
            stop: self.stop,
            period: self.period,
            is_active: self.is_active,
            devices: self
                .devices
                .iter()
                .filter_map(|id| devices.get(*id))
                .map(|d| d.view())
                .collect(),
        }
    }
}

/// `"HH:MM"` wire format for times of day. Seconds are accepted and dropped.
pub mod time_of_day {
    use chrono::{NaiveTime, Timelike};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(raw: &str) -> Result<NaiveTime, chrono::ParseError> {
        let raw = raw.trim();
        NaiveTime::parse_from_str(raw, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map(|t| t.with_second(0).unwrap_or(t))
    }

    pub fn format(time: &NaiveTime) -> String {
        time.format(FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
