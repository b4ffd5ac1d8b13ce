use crate::device::{
    Device, DeviceId, DeviceKind, DeviceRecord, DeviceReport, DeviceSet, DeviceView, HandleFactory, NewDevice,
    NewValve, PinNo, PinReading, PinState, ValveState, ValveUpdate, is_common_pin, reserved_pins,
};
use crate::repository::Repository;
use crate::task::interlock;
use crate::task::outcome::{Outcome, RigError, StatusCode};
use crate::task::scheduler::{Clock, FiringContext, SchedulerRunState, SystemClock};
use crate::task::settings::{Setting, SettingKey, Settings};
use crate::task::types::*;
use crate::weather::{WeatherGate, WeatherPrediction};
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PUMP_NAME: &str = "Pump";
const TASK_NOT_FOUND: &str = "Task not found.";
const EMPTY_DATA: &str = "Empty data were passed.";
const NOT_COMMON_PIN: &str = "are not for common use.";
const TASK_SAME_NAME: &str = "There is Task with the same Name.";
const TASK_SAME_PIN: &str = "This Task contains devices with the same pin number.";

/// In-memory model of the rig, guarded by the device lock
#[derive(Debug)]
pub struct RigState {
    pub devices: DeviceSet,
    pub tasks: BTreeMap<TaskId, IrrigationTask>,
    pub settings: Settings,
}

impl RigState {
    fn empty() -> Self {
        Self {
            devices: DeviceSet::new(),
            tasks: BTreeMap::new(),
            settings: Settings::from_entries(Vec::new()),
        }
    }

    /// Active tasks to schedule, if the rig can run the scheduler at all
    fn schedulable_tasks(&self) -> Result<Vec<IrrigationTask>, RigError> {
        if self.devices.pump().is_none() {
            return Err(RigError::NoPumpConfigured);
        }
        let active: Vec<IrrigationTask> = self.tasks.values().filter(|t| t.is_active).cloned().collect();
        if active.is_empty() {
            return Err(RigError::validation("There are no active tasks."));
        }
        Ok(active)
    }

    fn open_among(&self, ids: &[DeviceId]) -> Vec<DeviceId> {
        ids.iter()
            .copied()
            .filter(|id| self.devices.get(*id).is_some_and(|d| d.state() == PinState::High))
            .collect()
    }
}

/// Orchestrates devices, tasks, settings and the scheduler.
///
/// Every mutation runs inside a scheduler envelope: the scheduler is paused
/// (waiting for an in-flight trigger to finish), the mutation runs, and the
/// scheduler is started again if it was enabled before, whatever the mutation's
/// result. Only [`TaskManager::stop_scheduler`] and [`TaskManager::shutdown`]
/// clear the enabled flag.
pub struct TaskManager {
    repository: Arc<dyn Repository>,
    factory: HandleFactory,
    state: Arc<Mutex<RigState>>,
    scheduler: Mutex<Option<SchedulerRunState>>,
    enabled: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    weather: Option<Arc<dyn WeatherGate>>,
}

impl TaskManager {
    pub fn new(repository: Arc<dyn Repository>, factory: HandleFactory) -> Self {
        Self {
            repository,
            factory,
            state: Arc::new(Mutex::new(RigState::empty())),
            scheduler: Mutex::new(None),
            enabled: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(SystemClock),
            weather: None,
        }
    }

    pub fn with_weather_gate(mut self, gate: Arc<dyn WeatherGate>) -> Self {
        self.weather = Some(gate);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load devices, tasks and settings from the repository and start the
    /// scheduler when `autostartScheduler` is set and the rig can run it.
    pub async fn initialize(&self) -> Outcome<()> {
        let mut slot = self.scheduler.lock().await;
        if let Some(run) = slot.take() {
            run.cancel().await;
        }

        // Old handles go first so reloaded devices can claim the same pins
        let mut state = self.state.lock().await;
        state.devices.release_all();
        *state = RigState::empty();

        *state = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(operation = "initialize", "Loading rig state failed: {}", e);
                return Outcome::from_error(&e);
            }
        };
        info!(
            devices = state.devices.len(),
            tasks = state.tasks.len(),
            "Rig state loaded"
        );

        if state.settings.autostart_scheduler() {
            match state.schedulable_tasks() {
                Ok(active) => {
                    self.enabled.store(true, Ordering::SeqCst);
                    *slot = Some(SchedulerRunState::spawn(&self.firing_context(), &active));
                    info!(tasks = active.len(), "Scheduler has been started.");
                }
                Err(e) => info!("Scheduler autostart skipped: {}", e),
            }
        }

        Outcome::done(format!(
            "Loaded {} devices and {} tasks.",
            state.devices.len(),
            state.tasks.len()
        ))
    }

    async fn load(&self) -> Result<RigState, RigError> {
        let settings = Settings::from_entries(self.repository.get_settings().await?);
        let records = self.repository.get_devices().await?;
        let tasks = self.repository.get_tasks().await?;

        let mut devices = DeviceSet::new();
        for record in records {
            if !is_common_pin(record.pin_no) {
                warn!(device = %record.name, pin = record.pin_no, "Stored device uses a pin not meant for common use");
            }
            let handle = self.factory.create(record.pin_no);
            devices.insert(Device::new(record, handle));
        }

        let mut cached = BTreeMap::new();
        for record in &tasks {
            let mut task = IrrigationTask::from_record(record);
            task.devices.retain(|id| {
                let known = devices.valve(*id).is_some();
                if !known {
                    error!(task = %record.name, device = id, "Task references an unknown valve");
                }
                known
            });
            cached.insert(task.id, task);
        }

        Ok(RigState {
            devices,
            tasks: cached,
            settings,
        })
    }

    /// Stop the scheduler, turn the pump off, close every valve and release all handles
    pub async fn shutdown(&self) -> Outcome<Vec<DeviceReport>> {
        let mut slot = self.scheduler.lock().await;
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(run) = slot.take() {
            run.cancel().await;
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let drain = state.settings.pump_stop_delay();
        let closed = if state.devices.pump().is_some() {
            interlock::stop_pump_and_close_all(&mut state.devices, drain).await
        } else {
            Ok(interlock::close_all_without_pump(&mut state.devices))
        };
        state.devices.release_all();
        info!("Rig shut down");

        match closed {
            Ok(reports) => Outcome::from_reports(reports, "The rig has been shut down."),
            Err(e) => {
                error!(operation = "shutdown", "{}", e);
                Outcome::from_error(&e)
            }
        }
    }

    fn firing_context(&self) -> FiringContext {
        FiringContext {
            state: self.state.clone(),
            enabled: self.enabled.clone(),
            clock: self.clock.clone(),
            weather: self.weather.clone(),
            repository: self.repository.clone(),
        }
    }

    /// Pause the scheduler around `body` and restore it afterwards
    async fn track<T>(
        &self,
        operation: &'static str,
        body: impl Future<Output = Result<Outcome<T>, RigError>>,
    ) -> Outcome<T> {
        let mut slot = self.scheduler.lock().await;
        let was_enabled = self.enabled.load(Ordering::SeqCst);
        if let Some(run) = slot.take() {
            run.cancel().await;
            debug!(operation, "Scheduler has been paused.");
        }

        let outcome = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                if e.status() == StatusCode::InternalServerError {
                    error!(operation, "{}", e);
                } else {
                    warn!(operation, "{}", e);
                }
                Outcome::from_error(&e)
            }
            Err(panic) => {
                let e = RigError::inconsistency(format!("{} panicked: {}", operation, panic_message(&*panic)));
                error!(operation, "{}", e);
                Outcome::from_error(&e)
            }
        };

        if was_enabled {
            self.resume(&mut slot, operation).await;
        }
        outcome
    }

    /// Respawn waiters after a mutation. A rig with nothing to schedule leaves
    /// the scheduler enabled but idle until a later mutation makes it schedulable.
    async fn resume(&self, slot: &mut Option<SchedulerRunState>, operation: &'static str) {
        let state = self.state.lock().await;
        match state.schedulable_tasks() {
            Ok(active) => {
                *slot = Some(SchedulerRunState::spawn(&self.firing_context(), &active));
                debug!(operation, tasks = active.len(), "Scheduler resumed");
            }
            Err(e) => info!(operation, "Scheduler idle: {}", e),
        }
    }

    // Tasks

    pub async fn get_tasks(&self) -> Outcome<Vec<TaskView>> {
        let state = self.state.lock().await;
        Outcome::ok(state.tasks.values().map(|t| t.view(&state.devices)).collect())
    }

    pub async fn get_task_by_id(&self, id: TaskId) -> Outcome<TaskView> {
        let state = self.state.lock().await;
        match state.tasks.get(&id) {
            Some(task) => Outcome::ok(task.view(&state.devices)),
            None => Outcome::from_error(&RigError::not_found(TASK_NOT_FOUND)),
        }
    }

    pub async fn get_task_by_name(&self, name: &str) -> Outcome<TaskView> {
        let state = self.state.lock().await;
        match state.tasks.values().find(|t| t.name == name) {
            Some(task) => Outcome::ok(task.view(&state.devices)),
            None => Outcome::from_error(&RigError::not_found(TASK_NOT_FOUND)),
        }
    }

    pub async fn add_task(&self, task: NewTask) -> Outcome<TaskView> {
        self.track("add_task", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if task.name.trim().is_empty() {
                return Err(RigError::validation(EMPTY_DATA));
            }
            if state.tasks.values().any(|t| t.name == task.name) {
                return Err(RigError::validation(TASK_SAME_NAME));
            }
            check_task_devices(&state.devices, &task.device_ids)?;

            let record = self.repository.add_task(&task).await?;

            let cached = IrrigationTask::from_record(&record);
            if cached.devices != task.device_ids {
                return Err(RigError::inconsistency(format!(
                    "Stored task {} has devices {:?}, expected {:?}",
                    record.name, cached.devices, task.device_ids
                )));
            }
            let view = cached.view(&state.devices);
            state.tasks.insert(cached.id, cached);

            info!(task = %view.name, id = view.id, "Task added");
            Ok(Outcome::created(view).with_message("Task has been added."))
        })
        .await
    }

    /// Change a task's schedule. Deactivating a task closes its open valves.
    pub async fn update_task(&self, update: TaskUpdate) -> Outcome<TaskView> {
        self.track("update_task", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if update.name.trim().is_empty() {
                return Err(RigError::validation(EMPTY_DATA));
            }
            let current = state
                .tasks
                .get(&update.id)
                .ok_or_else(|| RigError::not_found(TASK_NOT_FOUND))?;
            if current.matches(&update) {
                return Err(RigError::validation("The same Task already exists."));
            }
            if state.tasks.values().any(|t| t.name == update.name && t.id != update.id) {
                return Err(RigError::validation(TASK_SAME_NAME));
            }
            let deactivating = current.is_active && !update.is_active;
            let open = state.open_among(&current.devices);

            let record = self.repository.update_task(&update).await?;

            let closed = if deactivating && !open.is_empty() {
                let drain = state.settings.pump_stop_delay();
                interlock::close_valves(&mut state.devices, &open, drain).await
            } else {
                Ok(Vec::new())
            };

            let task = state
                .tasks
                .get_mut(&update.id)
                .ok_or_else(|| RigError::inconsistency(format!("Task {} vanished from the cache", update.id)))?;
            task.apply(&update);
            let stored: Vec<DeviceId> = record.devices.iter().map(|d| d.id).collect();
            if stored != task.devices {
                return Err(RigError::inconsistency(format!(
                    "Task {} devices diverged: stored {:?}, cached {:?}",
                    task.name, stored, task.devices
                )));
            }
            let view = task.view(&state.devices);

            confirmed(closed?)?;
            info!(task = %view.name, id = view.id, "Task updated");
            Ok(Outcome::ok(view).with_message("Task has been updated."))
        })
        .await
    }

    /// Forget a task, closing its open valves through the interlock
    pub async fn delete_task(&self, id: TaskId) -> Outcome<()> {
        self.track("delete_task", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let task = state.tasks.get(&id).ok_or_else(|| RigError::not_found(TASK_NOT_FOUND))?;
            let open = state.open_among(&task.devices);

            self.repository.delete_task(id).await?;

            let closed = if open.is_empty() {
                Ok(Vec::new())
            } else {
                let drain = state.settings.pump_stop_delay();
                interlock::close_valves(&mut state.devices, &open, drain).await
            };

            let removed = state
                .tasks
                .remove(&id)
                .ok_or_else(|| RigError::inconsistency(format!("Task {} vanished from the cache", id)))?;

            confirmed(closed?)?;
            info!(task = %removed.name, id, "Task deleted");
            Ok(Outcome::done("Task has been deleted."))
        })
        .await
    }

    pub async fn assign_device(&self, task_id: TaskId, device_id: DeviceId) -> Outcome<TaskView> {
        self.track("assign_device", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let task = state
                .tasks
                .get(&task_id)
                .ok_or_else(|| RigError::not_found(TASK_NOT_FOUND))?;
            if task.has_device(device_id) {
                return Err(RigError::validation("Device is already assigned to Task."));
            }
            let mut devices = task.devices.clone();
            devices.push(device_id);
            check_task_devices(&state.devices, &devices)?;

            let record = self.repository.assign_device(task_id, device_id).await?;

            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| RigError::inconsistency(format!("Task {} vanished from the cache", task_id)))?;
            task.devices.push(device_id);
            let stored: Vec<DeviceId> = record.devices.iter().map(|d| d.id).collect();
            if stored != task.devices {
                return Err(RigError::inconsistency(format!(
                    "Task {} devices diverged after assign: stored {:?}, cached {:?}",
                    task.name, stored, task.devices
                )));
            }

            info!(task = %task.name, device = device_id, "Valve assigned to task");
            Ok(Outcome::ok(task.view(&state.devices)).with_message("Assign Valve to Task success."))
        })
        .await
    }

    pub async fn unassign_device(&self, task_id: TaskId, device_id: DeviceId) -> Outcome<TaskView> {
        self.track("unassign_device", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let task = state
                .tasks
                .get(&task_id)
                .ok_or_else(|| RigError::not_found(TASK_NOT_FOUND))?;
            if !task.has_device(device_id) {
                return Err(RigError::validation("Device is not assigned to Task."));
            }

            let record = self.repository.unassign_device(task_id, device_id).await?;

            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| RigError::inconsistency(format!("Task {} vanished from the cache", task_id)))?;
            task.devices.retain(|id| *id != device_id);
            let stored: Vec<DeviceId> = record.devices.iter().map(|d| d.id).collect();
            if stored != task.devices {
                return Err(RigError::inconsistency(format!(
                    "Task {} devices diverged after unassign: stored {:?}, cached {:?}",
                    task.name, stored, task.devices
                )));
            }

            info!(task = %task.name, device = device_id, "Valve unassigned from task");
            Ok(Outcome::ok(task.view(&state.devices)).with_message("Unassign Valve from Task success."))
        })
        .await
    }

    // Pump

    pub async fn get_pump(&self) -> Outcome<DeviceView> {
        let state = self.state.lock().await;
        match state.devices.pump() {
            Some(pump) => Outcome::ok(pump.view()),
            None => Outcome::from_error(&RigError::NoPumpConfigured),
        }
    }

    pub async fn add_pump(&self, pin_no: PinNo) -> Outcome<DeviceView> {
        self.track("add_pump", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state.devices.pump().is_some() {
                return Err(RigError::validation("The Pump already exists."));
            }
            check_pin(&state.devices, pin_no, None)?;
            if state.devices.name_taken(PUMP_NAME, None) {
                return Err(RigError::validation("Device with this name already exists."));
            }

            let record = self
                .repository
                .add_device(&NewDevice {
                    name: PUMP_NAME.to_string(),
                    pin_no,
                    kind: DeviceKind::Pump,
                })
                .await?;

            let pump = Device::new(record, self.factory.create(pin_no));
            let view = pump.view();
            state.devices.insert(pump);

            info!(pin = pin_no, "Pump added");
            Ok(Outcome::created(view).with_message("The Pump has been added."))
        })
        .await
    }

    /// Re-bind the pump to another pin. The old line is released (driven LOW).
    pub async fn change_pump_pin(&self, pin_no: PinNo) -> Outcome<DeviceView> {
        self.track("change_pump_pin", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let pump = state.devices.pump().ok_or(RigError::NoPumpConfigured)?;
            let mut record = pump.record();
            if record.pin_no == pin_no {
                return Err(RigError::validation(format!("The Pump already uses pin {}.", pin_no)));
            }
            check_pin(&state.devices, pin_no, Some(record.id))?;
            let was_running = pump.state() == PinState::High;
            record.pin_no = pin_no;

            self.repository.update_device(&record).await?;

            let pump = state
                .devices
                .pump_mut()
                .ok_or_else(|| RigError::inconsistency("The Pump vanished from the cache"))?;
            pump.rebind(pin_no, self.factory.create(pin_no));
            if was_running {
                warn!(pin = pin_no, "The Pump was running and stays off until the next start");
            }

            info!(pin = pin_no, "Pump pin changed");
            Ok(Outcome::ok(pump.view()).with_message("The Pump pin number has been updated."))
        })
        .await
    }

    /// Remove the pump: stop it, drain, close every valve, then release its line.
    ///
    /// A pump that does not read back LOW is still removed, and every valve is
    /// closed after it. The outcome is an actuation fault listing the pump first.
    pub async fn delete_pump(&self) -> Outcome<Vec<DeviceReport>> {
        self.track("delete_pump", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let id = state.devices.pump().ok_or(RigError::NoPumpConfigured)?.id;

            self.repository.delete_device(id).await?;

            let drain = state.settings.pump_stop_delay();
            let stopped = interlock::stop_pump_and_close_all(&mut state.devices, drain).await;
            let mut pump = state
                .devices
                .remove(id)
                .ok_or_else(|| RigError::inconsistency("The Pump vanished from the cache"))?;
            pump.release();

            let reports = match stopped {
                Ok(reports) => reports,
                Err(RigError::Actuation(mut faults)) => {
                    // No pump record is left to keep these open for
                    warn!(pin = pump.pin_no, "The Pump did not stop, closing every valve without it");
                    faults.extend(interlock::close_all_without_pump(&mut state.devices));
                    return Err(RigError::Actuation(faults));
                }
                Err(e) => return Err(e),
            };
            info!("Pump deleted");
            Ok(Outcome::from_reports(reports, "The Pump has been deleted."))
        })
        .await
    }

    pub async fn turn_off_pump(&self) -> Outcome<Vec<DeviceReport>> {
        self.track("turn_off_pump", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let drain = state.settings.pump_stop_delay();
            let reports = interlock::stop_pump_and_close_all(&mut state.devices, drain).await?;
            Ok(Outcome::from_reports(
                reports,
                "The Pump has been turned off and all Valves are closed.",
            ))
        })
        .await
    }

    // Valves

    pub async fn get_valves(&self) -> Outcome<Vec<DeviceView>> {
        let state = self.state.lock().await;
        Outcome::ok(state.devices.valves().map(Device::view).collect())
    }

    pub async fn add_valve(&self, valve: NewValve) -> Outcome<DeviceView> {
        self.track("add_valve", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if valve.name.trim().is_empty() {
                return Err(RigError::validation(EMPTY_DATA));
            }
            if state.devices.name_taken(&valve.name, None) {
                return Err(RigError::validation("Valve with this name already exists."));
            }
            check_pin(&state.devices, valve.pin_no, None)?;

            let record = self
                .repository
                .add_device(&NewDevice {
                    name: valve.name.clone(),
                    pin_no: valve.pin_no,
                    kind: DeviceKind::Valve,
                })
                .await?;

            let device = Device::new(record, self.factory.create(valve.pin_no));
            let view = device.view();
            state.devices.insert(device);

            info!(valve = %view.name, pin = view.pin_no, "Valve added");
            Ok(Outcome::created(view).with_message("Valve has been added."))
        })
        .await
    }

    /// Rename or re-pin a valve. An open valve is closed through the interlock
    /// before its line is released.
    pub async fn update_valve(&self, update: ValveUpdate) -> Outcome<DeviceView> {
        self.track("update_valve", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let valve = state
                .devices
                .valve(update.id)
                .ok_or_else(|| RigError::not_found(format!("The Valve with id {} does not exist.", update.id)))?;
            if valve.name == update.name && valve.pin_no == update.pin_no {
                return Err(RigError::validation("The same Valve already exists."));
            }
            if update.name.trim().is_empty() {
                return Err(RigError::validation(EMPTY_DATA));
            }
            if state.devices.name_taken(&update.name, Some(update.id)) {
                return Err(RigError::validation("Valve with this name already exists."));
            }
            check_pin(&state.devices, update.pin_no, Some(update.id))?;
            let pin_changed = valve.pin_no != update.pin_no;
            let open = valve.state() == PinState::High;

            self.repository
                .update_device(&DeviceRecord {
                    id: update.id,
                    name: update.name.clone(),
                    pin_no: update.pin_no,
                    kind: DeviceKind::Valve,
                })
                .await?;

            let closed = if pin_changed && open {
                let drain = state.settings.pump_stop_delay();
                interlock::close_valves(&mut state.devices, &[update.id], drain).await
            } else {
                Ok(Vec::new())
            };

            let valve = state
                .devices
                .get_mut(update.id)
                .ok_or_else(|| RigError::inconsistency(format!("Valve {} vanished from the cache", update.id)))?;
            valve.name = update.name.clone();
            if pin_changed {
                valve.rebind(update.pin_no, self.factory.create(update.pin_no));
            }
            let view = valve.view();

            confirmed(closed?)?;
            info!(valve = %view.name, pin = view.pin_no, "Valve updated");
            Ok(Outcome::ok(view).with_message("Valve has been updated."))
        })
        .await
    }

    /// Delete a valve, closing it through the interlock and unlinking it from every task
    pub async fn delete_valve(&self, id: DeviceId) -> Outcome<()> {
        self.track("delete_valve", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let valve = state
                .devices
                .valve(id)
                .ok_or_else(|| RigError::not_found(format!("The Valve with id {} does not exist.", id)))?;
            let open = valve.state() == PinState::High;

            self.repository.delete_device(id).await?;

            let closed = if open {
                let drain = state.settings.pump_stop_delay();
                interlock::close_valves(&mut state.devices, &[id], drain).await
            } else {
                Ok(Vec::new())
            };

            let mut valve = state
                .devices
                .remove(id)
                .ok_or_else(|| RigError::inconsistency(format!("Valve {} vanished from the cache", id)))?;
            valve.release();
            for task in state.tasks.values_mut() {
                task.devices.retain(|d| *d != id);
            }

            confirmed(closed?)?;
            info!(valve = %valve.name, "Valve deleted");
            Ok(Outcome::done("The Valve has been deleted."))
        })
        .await
    }

    // Device states

    pub async fn get_valve_state(&self, id: DeviceId) -> Outcome<ValveState> {
        let state = self.state.lock().await;
        match state.devices.valve(id) {
            Some(valve) => Outcome::ok(ValveState {
                id: valve.id,
                name: valve.name.clone(),
                state: valve.state(),
            }),
            None => Outcome::from_error(&RigError::not_found(format!("Valve {} not found.", id))),
        }
    }

    /// Live state of whichever device, valve or pump, is bound to `pin_no`
    pub async fn get_pin_state(&self, pin_no: PinNo) -> Outcome<PinReading> {
        let state = self.state.lock().await;
        match state.devices.by_pin(pin_no) {
            Some(device) => Outcome::ok(PinReading {
                pin_no,
                state: device.state(),
            }),
            None => Outcome::from_error(&RigError::not_found(format!("No device with pin no: {}.", pin_no))),
        }
    }

    /// Open or close every valve of a task through the interlock
    pub async fn change_task_states(&self, id: TaskId, target: PinState) -> Outcome<Vec<DeviceReport>> {
        self.track("change_task_states", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let valves = state
                .tasks
                .get(&id)
                .map(|t| t.devices.clone())
                .ok_or_else(|| RigError::not_found("No Task with this id."))?;
            let reports = drive_valves(state, &valves, target).await?;
            Ok(Outcome::from_reports(
                reports,
                format!("Task Valves state changed to state {}.", target),
            ))
        })
        .await
    }

    pub async fn change_valve_state(&self, id: DeviceId, target: PinState) -> Outcome<Vec<DeviceReport>> {
        self.track("change_valve_state", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state.devices.valve(id).is_none() {
                return Err(RigError::not_found(format!("Valve {} not found.", id)));
            }
            let reports = drive_valves(state, &[id], target).await?;
            Ok(Outcome::from_reports(reports, "Valve state has been changed."))
        })
        .await
    }

    /// Like [`TaskManager::change_valve_state`], addressing the valve by pin
    pub async fn change_pin_state(&self, pin_no: PinNo, target: PinState) -> Outcome<Vec<DeviceReport>> {
        self.track("change_pin_state", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let id = state
                .devices
                .valves()
                .find(|v| v.pin_no == pin_no)
                .map(|v| v.id)
                .ok_or_else(|| RigError::not_found(format!("No valve with pin no: {}.", pin_no)))?;
            let reports = drive_valves(state, &[id], target).await?;
            Ok(Outcome::from_reports(reports, "Valve state has been changed."))
        })
        .await
    }

    /// Turn the pump off and close every valve
    pub async fn close_all_valves(&self) -> Outcome<Vec<DeviceReport>> {
        self.track("close_all_valves", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state.devices.pump().is_none() {
                let reports = interlock::close_all_without_pump(&mut state.devices);
                return Ok(Outcome::from_reports(reports, "Every valve was closed."));
            }

            let drain = state.settings.pump_stop_delay();
            let reports = interlock::stop_pump_and_close_all(&mut state.devices, drain).await?;
            Ok(Outcome::from_reports(reports, "The Pump and every valve were closed."))
        })
        .await
    }

    // Scheduler

    pub fn is_scheduler_enabled(&self) -> Outcome<bool> {
        Outcome::ok(self.enabled.load(Ordering::SeqCst))
    }

    /// Number of waiters currently scheduled
    pub async fn scheduled_waiters(&self) -> usize {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .map(SchedulerRunState::waiter_count)
            .unwrap_or(0)
    }

    /// Start the scheduler. Needs a pump and at least one active task; a
    /// running scheduler is replaced.
    pub async fn run_scheduler(&self) -> Outcome<()> {
        let mut slot = self.scheduler.lock().await;

        let active = match self.state.lock().await.schedulable_tasks() {
            Ok(active) => active,
            Err(e) => {
                warn!(operation = "run_scheduler", "{}", e);
                return Outcome::from_error(&e);
            }
        };

        if let Some(run) = slot.take() {
            run.cancel().await;
        }
        self.enabled.store(true, Ordering::SeqCst);
        *slot = Some(SchedulerRunState::spawn(&self.firing_context(), &active));

        info!(tasks = active.len(), "Scheduler has been started.");
        Outcome::done("Scheduler has been started.")
    }

    pub async fn stop_scheduler(&self) -> Outcome<()> {
        let mut slot = self.scheduler.lock().await;
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(run) = slot.take() {
            run.cancel().await;
        }

        info!("Scheduler has been stopped.");
        Outcome::done("Scheduler has been stopped.")
    }

    // Weather

    /// Forecasts the weather gate has answered with, oldest first
    pub async fn get_weather_predictions(&self) -> Outcome<Vec<WeatherPrediction>> {
        match self.repository.get_weather_predictions().await {
            Ok(predictions) => Outcome::ok(predictions),
            Err(e) => {
                let e = RigError::from(e);
                error!(operation = "get_weather_predictions", "{}", e);
                Outcome::from_error(&e)
            }
        }
    }

    // Settings

    pub async fn get_settings(&self) -> Outcome<Vec<Setting>> {
        Outcome::ok(self.state.lock().await.settings.entries().to_vec())
    }

    pub async fn get_setting(&self, key: &str) -> Outcome<Setting> {
        let state = self.state.lock().await;
        let found = key
            .parse::<SettingKey>()
            .ok()
            .and_then(|k| state.settings.get(k).cloned());
        match found {
            Some(setting) => Outcome::ok(setting),
            None => Outcome::from_error(&RigError::not_found("Key not found.")),
        }
    }

    /// Update several settings. Every key and value is checked before any is stored.
    pub async fn update_settings(&self, updates: Vec<Setting>) -> Outcome<Vec<Setting>> {
        self.track("update_settings", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if updates.is_empty() {
                return Err(RigError::validation(EMPTY_DATA));
            }
            let mut checked = Vec::with_capacity(updates.len());
            for setting in &updates {
                let key = setting
                    .key
                    .parse::<SettingKey>()
                    .map_err(|e| RigError::validation(e.to_string()))?;
                key.validate(&setting.value)
                    .map_err(|e| RigError::validation(e.to_string()))?;
                checked.push((key, setting.value.trim().to_string()));
            }

            for (key, value) in checked {
                let stored = self.repository.update_setting(&Setting::new(key, value)).await?;
                state.settings.set(key, stored.value);
                debug!(key = %key, "Setting updated");
            }

            info!(count = updates.len(), "Settings updated");
            Ok(Outcome::ok(state.settings.entries().to_vec()).with_message("Update settings successful."))
        })
        .await
    }
}

/// Open (`High`) or close (`Low`) `valves` through the interlock
async fn drive_valves(
    state: &mut RigState,
    valves: &[DeviceId],
    target: PinState,
) -> Result<Vec<DeviceReport>, RigError> {
    match target {
        PinState::High => interlock::open_valves(&mut state.devices, valves),
        PinState::Low => {
            let drain = state.settings.pump_stop_delay();
            interlock::close_valves(&mut state.devices, valves, drain).await
        }
        PinState::Undefined => Err(RigError::validation("Only HIGH or LOW can be requested.")),
    }
}

/// Whitelisted and not bound to any device other than `except`
fn check_pin(devices: &DeviceSet, pin_no: PinNo, except: Option<DeviceId>) -> Result<(), RigError> {
    if !is_common_pin(pin_no) {
        return Err(RigError::validation(format!("Pins: {} {}", pin_no, NOT_COMMON_PIN)));
    }
    match devices.by_pin(pin_no).filter(|d| Some(d.id) != except) {
        Some(d) if d.is_pump() => Err(RigError::validation("This GPIO Pin number is reserved for The Pump.")),
        Some(_) => Err(RigError::validation("Device with the same GPIO Pin number already exists.")),
        None => Ok(()),
    }
}

/// Every id names a valve, with whitelisted and pairwise distinct pins
fn check_task_devices(devices: &DeviceSet, ids: &[DeviceId]) -> Result<(), RigError> {
    let mut pins = Vec::with_capacity(ids.len());
    for id in ids {
        let valve = devices
            .valve(*id)
            .ok_or_else(|| RigError::not_found(format!("Valve {} not found.", id)))?;
        pins.push(valve.pin_no);
    }

    let reserved = reserved_pins(pins.iter().copied());
    if !reserved.is_empty() {
        let listed: Vec<String> = reserved.iter().map(|p| p.to_string()).collect();
        return Err(RigError::validation(format!("Pins: {} {}", listed.join(", "), NOT_COMMON_PIN)));
    }

    let mut seen = pins.clone();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != pins.len() {
        return Err(RigError::validation(TASK_SAME_PIN));
    }
    Ok(())
}

/// Turn read-back mismatches into an actuation fault
fn confirmed(reports: Vec<DeviceReport>) -> Result<Vec<DeviceReport>, RigError> {
    if reports.iter().all(DeviceReport::is_ok) {
        Ok(reports)
    } else {
        Err(RigError::Actuation(reports))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
