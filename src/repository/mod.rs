//! Durable storage for devices, tasks, settings and weather predictions.
//!
//! The manager only ever talks to [`Repository`]; [`FileRepository`] is the
//! bundled implementation.

pub mod store;

pub use store::*;

use crate::device::{DeviceId, DeviceRecord, NewDevice};
use crate::task::outcome::StatusCode;
use crate::task::settings::Setting;
use crate::task::types::{NewTask, TaskId, TaskRecord, TaskUpdate};
use crate::weather::{NewWeatherPrediction, WeatherPrediction};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn status(&self) -> StatusCode {
        match self {
            RepositoryError::NotFound(_) | RepositoryError::Conflict(_) => StatusCode::BadRequest,
            RepositoryError::Storage(_) => StatusCode::InternalServerError,
        }
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(e: std::io::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

/// Storage operations consumed by the task manager
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_tasks(&self) -> Result<Vec<TaskRecord>, RepositoryError>;

    async fn get_task_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, RepositoryError>;

    async fn get_task_by_name(&self, name: &str) -> Result<Option<TaskRecord>, RepositoryError>;

    /// Store a new task with its initial valves and return it with its id
    async fn add_task(&self, task: &NewTask) -> Result<TaskRecord, RepositoryError>;

    async fn update_task(&self, update: &TaskUpdate) -> Result<TaskRecord, RepositoryError>;

    async fn delete_task(&self, id: TaskId) -> Result<(), RepositoryError>;

    async fn assign_device(&self, task_id: TaskId, device_id: DeviceId) -> Result<TaskRecord, RepositoryError>;

    async fn unassign_device(&self, task_id: TaskId, device_id: DeviceId) -> Result<TaskRecord, RepositoryError>;

    async fn get_devices(&self) -> Result<Vec<DeviceRecord>, RepositoryError>;

    async fn get_device_by_id(&self, id: DeviceId) -> Result<Option<DeviceRecord>, RepositoryError>;

    async fn get_device_by_name(&self, name: &str) -> Result<Option<DeviceRecord>, RepositoryError>;

    async fn add_device(&self, device: &NewDevice) -> Result<DeviceRecord, RepositoryError>;

    async fn update_device(&self, device: &DeviceRecord) -> Result<DeviceRecord, RepositoryError>;

    /// Remove a device and unlink it from every task
    async fn delete_device(&self, id: DeviceId) -> Result<(), RepositoryError>;

    async fn get_settings(&self) -> Result<Vec<Setting>, RepositoryError>;

    async fn update_setting(&self, setting: &Setting) -> Result<Setting, RepositoryError>;

    async fn add_weather_prediction(
        &self,
        prediction: &NewWeatherPrediction,
    ) -> Result<WeatherPrediction, RepositoryError>;

    /// Every recorded prediction, oldest first
    async fn get_weather_predictions(&self) -> Result<Vec<WeatherPrediction>, RepositoryError>;
}
