use crate::device::{DeviceId, DeviceKind, DeviceRecord, NewDevice};
use crate::repository::{Repository, RepositoryError};
use crate::task::settings::{Setting, Settings};
use crate::task::types::{NewTask, Period, TaskDevice, TaskId, TaskRecord, TaskUpdate, time_of_day};
use crate::weather::{NewWeatherPrediction, WeatherPrediction};
use async_trait::async_trait;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Repository kept in memory and, when opened on a path, mirrored to a JSON file.
///
/// Every mutation is applied to a copy of the data, written out, and only then
/// made visible; a failed write leaves the repository as it was.
#[derive(Debug)]
pub struct FileRepository {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct StoreData {
    next_task_id: TaskId,
    next_device_id: DeviceId,
    devices: Vec<DeviceRecord>,
    tasks: Vec<StoredTask>,
    settings: Vec<Setting>,
    #[serde(default)]
    weather_predictions: Vec<WeatherPrediction>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct StoredTask {
    id: TaskId,
    name: String,
    #[serde(with = "time_of_day")]
    start: NaiveTime,
    #[serde(with = "time_of_day")]
    stop: NaiveTime,
    period: Period,
    is_active: bool,
    device_ids: Vec<DeviceId>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            next_task_id: 1,
            next_device_id: 1,
            devices: Vec::new(),
            tasks: Vec::new(),
            settings: Settings::defaults(),
            weather_predictions: Vec::new(),
        }
    }
}

impl StoreData {
    fn task_record(&self, task: &StoredTask) -> TaskRecord {
        TaskRecord {
            id: task.id,
            name: task.name.clone(),
            start: task.start,
            stop: task.stop,
            period: task.period,
            is_active: task.is_active,
            devices: task
                .device_ids
                .iter()
                .filter_map(|id| self.devices.iter().find(|d| d.id == *id))
                .map(|d| TaskDevice {
                    id: d.id,
                    name: d.name.clone(),
                    pin_no: d.pin_no,
                })
                .collect(),
        }
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut StoredTask, RepositoryError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Task {} does not exist.", id)))
    }

    fn task_record_by_id(&self, id: TaskId) -> Result<TaskRecord, RepositoryError> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .map(|t| self.task_record(t))
            .ok_or_else(|| RepositoryError::NotFound(format!("Task {} does not exist.", id)))
    }

    fn check_task_name(&self, name: &str, except: Option<TaskId>) -> Result<(), RepositoryError> {
        if self.tasks.iter().any(|t| t.name == name && Some(t.id) != except) {
            return Err(RepositoryError::Conflict(format!(
                "Task with name {} already exists.",
                name
            )));
        }
        Ok(())
    }

    fn check_valve(&self, id: DeviceId) -> Result<(), RepositoryError> {
        match self.devices.iter().find(|d| d.id == id) {
            Some(d) if d.kind == DeviceKind::Valve => Ok(()),
            Some(d) => Err(RepositoryError::Conflict(format!("{} is not a valve.", d.name))),
            None => Err(RepositoryError::NotFound(format!("Device {} does not exist.", id))),
        }
    }

    fn check_device(&self, name: &str, pin_no: u8, except: Option<DeviceId>) -> Result<(), RepositoryError> {
        let others = || self.devices.iter().filter(move |d| Some(d.id) != except);
        if others().any(|d| d.name == name) {
            return Err(RepositoryError::Conflict(format!(
                "Device with name {} already exists.",
                name
            )));
        }
        if others().any(|d| d.pin_no == pin_no) {
            return Err(RepositoryError::Conflict(format!(
                "Pin {} is already in use.",
                pin_no
            )));
        }
        Ok(())
    }
}

impl FileRepository {
    /// Repository that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        }
    }

    /// Open the JSON state file at `path`, creating it with default settings if missing
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref().to_path_buf();

        let data = if async_fs::try_exists(&path).await? {
            let raw = async_fs::read_to_string(&path).await?;
            let mut data: StoreData = serde_json::from_str(&raw)?;
            data.settings = Settings::from_entries(data.settings).entries().to_vec();
            info!(path = %path.display(), devices = data.devices.len(), tasks = data.tasks.len(), "Loaded rig state");
            data
        } else {
            let data = StoreData::default();
            write_atomically(&path, &data).await?;
            info!(path = %path.display(), "Created new rig state file");
            data
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply `change` to a copy of the store, persist it, then publish it
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut StoreData) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut guard = self.data.write().await;
        let mut next = guard.clone();
        let value = change(&mut next)?;

        if let Some(path) = &self.path {
            write_atomically(path, &next).await?;
        }

        *guard = next;
        Ok(value)
    }
}

async fn write_atomically(path: &Path, data: &StoreData) -> Result<(), RepositoryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        async_fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(data)?;
    let temp = path.with_extension("json.tmp");
    async_fs::write(&temp, json.as_bytes()).await?;
    async_fs::rename(&temp, path).await?;

    debug!(path = %path.display(), bytes = json.len(), "Rig state written");
    Ok(())
}

#[async_trait]
impl Repository for FileRepository {
    async fn get_tasks(&self) -> Result<Vec<TaskRecord>, RepositoryError> {
        let data = self.data.read().await;
        Ok(data.tasks.iter().map(|t| data.task_record(t)).collect())
    }

    async fn get_task_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, RepositoryError> {
        let data = self.data.read().await;
        Ok(data.tasks.iter().find(|t| t.id == id).map(|t| data.task_record(t)))
    }

    async fn get_task_by_name(&self, name: &str) -> Result<Option<TaskRecord>, RepositoryError> {
        let data = self.data.read().await;
        Ok(data
            .tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| data.task_record(t)))
    }

    async fn add_task(&self, task: &NewTask) -> Result<TaskRecord, RepositoryError> {
        self.mutate(|data| {
            data.check_task_name(&task.name, None)?;
            let mut device_ids: Vec<DeviceId> = Vec::with_capacity(task.device_ids.len());
            for id in &task.device_ids {
                data.check_valve(*id)?;
                if !device_ids.contains(id) {
                    device_ids.push(*id);
                }
            }

            let id = data.next_task_id;
            data.next_task_id += 1;
            data.tasks.push(StoredTask {
                id,
                name: task.name.clone(),
                start: task.start,
                stop: task.stop,
                period: task.period,
                is_active: task.is_active,
                device_ids,
            });
            data.task_record_by_id(id)
        })
        .await
    }

    async fn update_task(&self, update: &TaskUpdate) -> Result<TaskRecord, RepositoryError> {
        self.mutate(|data| {
            data.check_task_name(&update.name, Some(update.id))?;
            let task = data.task_mut(update.id)?;
            task.name = update.name.clone();
            task.start = update.start;
            task.stop = update.stop;
            task.period = update.period;
            task.is_active = update.is_active;
            data.task_record_by_id(update.id)
        })
        .await
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), RepositoryError> {
        self.mutate(|data| {
            data.task_mut(id)?;
            data.tasks.retain(|t| t.id != id);
            Ok(())
        })
        .await
    }

    async fn assign_device(&self, task_id: TaskId, device_id: DeviceId) -> Result<TaskRecord, RepositoryError> {
        self.mutate(|data| {
            data.check_valve(device_id)?;
            let task = data.task_mut(task_id)?;
            if task.device_ids.contains(&device_id) {
                return Err(RepositoryError::Conflict(format!(
                    "Device {} is already assigned to task {}.",
                    device_id, task.name
                )));
            }
            task.device_ids.push(device_id);
            data.task_record_by_id(task_id)
        })
        .await
    }

    async fn unassign_device(&self, task_id: TaskId, device_id: DeviceId) -> Result<TaskRecord, RepositoryError> {
        self.mutate(|data| {
            let task = data.task_mut(task_id)?;
            if !task.device_ids.contains(&device_id) {
                return Err(RepositoryError::NotFound(format!(
                    "Device {} is not assigned to task {}.",
                    device_id, task.name
                )));
            }
            task.device_ids.retain(|id| *id != device_id);
            data.task_record_by_id(task_id)
        })
        .await
    }

    async fn get_devices(&self) -> Result<Vec<DeviceRecord>, RepositoryError> {
        Ok(self.data.read().await.devices.clone())
    }

    async fn get_device_by_id(&self, id: DeviceId) -> Result<Option<DeviceRecord>, RepositoryError> {
        Ok(self.data.read().await.devices.iter().find(|d| d.id == id).cloned())
    }

    async fn get_device_by_name(&self, name: &str) -> Result<Option<DeviceRecord>, RepositoryError> {
        Ok(self
            .data
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn add_device(&self, device: &NewDevice) -> Result<DeviceRecord, RepositoryError> {
        self.mutate(|data| {
            data.check_device(&device.name, device.pin_no, None)?;
            if device.kind == DeviceKind::Pump && data.devices.iter().any(|d| d.kind == DeviceKind::Pump) {
                return Err(RepositoryError::Conflict("The Pump already exists.".to_string()));
            }

            let record = DeviceRecord {
                id: data.next_device_id,
                name: device.name.clone(),
                pin_no: device.pin_no,
                kind: device.kind,
            };
            data.next_device_id += 1;
            data.devices.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn update_device(&self, device: &DeviceRecord) -> Result<DeviceRecord, RepositoryError> {
        self.mutate(|data| {
            data.check_device(&device.name, device.pin_no, Some(device.id))?;
            let stored = data
                .devices
                .iter_mut()
                .find(|d| d.id == device.id)
                .ok_or_else(|| RepositoryError::NotFound(format!("Device {} does not exist.", device.id)))?;
            stored.name = device.name.clone();
            stored.pin_no = device.pin_no;
            Ok(stored.clone())
        })
        .await
    }

    async fn delete_device(&self, id: DeviceId) -> Result<(), RepositoryError> {
        self.mutate(|data| {
            if !data.devices.iter().any(|d| d.id == id) {
                return Err(RepositoryError::NotFound(format!("Device {} does not exist.", id)));
            }
            data.devices.retain(|d| d.id != id);
            for task in &mut data.tasks {
                task.device_ids.retain(|d| *d != id);
            }
            Ok(())
        })
        .await
    }

    async fn get_settings(&self) -> Result<Vec<Setting>, RepositoryError> {
        Ok(self.data.read().await.settings.clone())
    }

    async fn update_setting(&self, setting: &Setting) -> Result<Setting, RepositoryError> {
        self.mutate(|data| {
            match data.settings.iter_mut().find(|s| s.key == setting.key) {
                Some(stored) => stored.value = setting.value.clone(),
                None => data.settings.push(setting.clone()),
            }
            Ok(setting.clone())
        })
        .await
    }

    async fn add_weather_prediction(
        &self,
        prediction: &NewWeatherPrediction,
    ) -> Result<WeatherPrediction, RepositoryError> {
        self.mutate(|data| {
            let id = data.weather_predictions.last().map_or(1, |p| p.id + 1);
            let forecast = prediction.forecast;
            let stored = WeatherPrediction {
                id,
                recorded_at: prediction.recorded_at,
                rain_mm: forecast.rain_mm,
                threshold_mm: forecast.threshold_mm,
                should_water: forecast.should_water(),
            };
            data.weather_predictions.push(stored.clone());
            Ok(stored)
        })
        .await
    }

    async fn get_weather_predictions(&self) -> Result<Vec<WeatherPrediction>, RepositoryError> {
        Ok(self.data.read().await.weather_predictions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::settings::SettingKey;
    use crate::weather::RainForecast;
    use tempfile::TempDir;

    fn valve(name: &str, pin_no: u8) -> NewDevice {
        NewDevice {
            name: name.to_string(),
            pin_no,
            kind: DeviceKind::Valve,
        }
    }

    fn task(name: &str, device_ids: Vec<DeviceId>) -> NewTask {
        NewTask {
            name: name.to_string(),
            start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            stop: NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
            period: Period::Everyday,
            is_active: true,
            device_ids,
        }
    }

    #[tokio::test]
    async fn test_device_names_and_pins_are_unique() {
        let repo = FileRepository::in_memory();
        repo.add_device(&valve("Front", 17)).await.unwrap();

        assert!(matches!(
            repo.add_device(&valve("Front", 27)).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            repo.add_device(&valve("Back", 17)).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(repo.get_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleting_device_unlinks_it_from_tasks() {
        let repo = FileRepository::in_memory();
        let front = repo.add_device(&valve("Front", 17)).await.unwrap();
        let back = repo.add_device(&valve("Back", 27)).await.unwrap();
        let added = repo.add_task(&task("Morning", vec![front.id, back.id])).await.unwrap();
        assert_eq!(added.devices.len(), 2);

        repo.delete_device(front.id).await.unwrap();

        let stored = repo.get_task_by_id(added.id).await.unwrap().unwrap();
        assert_eq!(stored.devices.len(), 1);
        assert_eq!(stored.devices[0].name, "Back");
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("rig.json");

        {
            let repo = FileRepository::open(&path).await.unwrap();
            let front = repo.add_device(&valve("Front", 17)).await.unwrap();
            repo.add_task(&task("Morning", vec![front.id])).await.unwrap();
            repo.update_setting(&Setting::new(SettingKey::PumpStopDelay, "1500"))
                .await
                .unwrap();
        }

        let repo = FileRepository::open(&path).await.unwrap();
        let tasks = repo.get_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].devices[0].pin_no, 17);

        let settings = Settings::from_entries(repo.get_settings().await.unwrap());
        assert_eq!(settings.pump_stop_delay(), std::time::Duration::from_millis(1500));

        let next = repo.add_device(&valve("Back", 27)).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rig.json");
        let repo = FileRepository::open(&path).await.unwrap();

        // A directory where the temp file should go makes the write fail
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let result = repo.add_device(&valve("Front", 17)).await;
        assert!(matches!(result, Err(RepositoryError::Storage(_))));
        assert!(repo.get_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_weather_predictions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rig.json");
        let at = |h| {
            chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap()
        };
        let prediction = |h, rain_mm| NewWeatherPrediction {
            recorded_at: at(h),
            forecast: RainForecast {
                rain_mm,
                threshold_mm: 10.0,
            },
        };

        {
            let repo = FileRepository::open(&path).await.unwrap();
            let first = repo.add_weather_prediction(&prediction(6, 0.4)).await.unwrap();
            assert_eq!(first.id, 1);
            assert!(first.should_water);
        }

        let repo = FileRepository::open(&path).await.unwrap();
        let second = repo.add_weather_prediction(&prediction(18, 14.0)).await.unwrap();
        assert_eq!(second.id, 2);
        assert!(!second.should_water);

        let history = repo.get_weather_predictions().await.unwrap();
        let recorded: Vec<_> = history.iter().map(|p| (p.id, p.recorded_at)).collect();
        assert_eq!(recorded, vec![(1, at(6)), (2, at(18))]);
    }

    #[tokio::test]
    async fn test_state_file_without_predictions_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rig.json");
        std::fs::write(
            &path,
            r#"{"nextTaskId":1,"nextDeviceId":1,"devices":[],"tasks":[],"settings":[]}"#,
        )
        .unwrap();

        let repo = FileRepository::open(&path).await.unwrap();
        assert!(repo.get_weather_predictions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_pump() {
        let repo = FileRepository::in_memory();
        let pump = |pin_no| NewDevice {
            name: format!("Pump {}", pin_no),
            pin_no,
            kind: DeviceKind::Pump,
        };
        repo.add_device(&pump(5)).await.unwrap();
        assert!(matches!(
            repo.add_device(&pump(6)).await,
            Err(RepositoryError::Conflict(_))
        ));
    }
}
