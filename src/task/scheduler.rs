use crate::device::DeviceReport;
use crate::repository::Repository;
use crate::task::interlock;
use crate::task::manager::RigState;
use crate::task::outcome::RigError;
use crate::task::types::{IrrigationTask, TaskId};
use crate::weather::{self, WeatherGate};
use chrono::{Days, NaiveDateTime, NaiveTime};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of local wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> NaiveDateTime;
}

/// Local time of the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Wall time anchored to tokio's monotonic clock.
///
/// Reads `origin_wall` plus the time elapsed since construction, so it follows
/// `tokio::time::pause`/`advance` and lets tests run a whole day in a few
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    origin_wall: NaiveDateTime,
    origin: tokio::time::Instant,
}

impl AnchoredClock {
    pub fn new(origin_wall: NaiveDateTime) -> Self {
        Self {
            origin_wall,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_default();
        self.origin_wall + elapsed
    }
}

/// Time left until the next occurrence of `at`. An occurrence that is now or in
/// the past rolls over to tomorrow.
pub fn time_until(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut target = now.date().and_time(at);
    if target <= now {
        target = target.checked_add_days(Days::new(1)).unwrap_or(target);
    }
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Which edge of a task's window a waiter fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Start,
    Stop,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => write!(f, "start"),
            Transition::Stop => write!(f, "stop"),
        }
    }
}

/// Everything a waiter needs to fire, shared with the manager
#[derive(Clone)]
pub(crate) struct FiringContext {
    pub state: Arc<Mutex<RigState>>,
    pub enabled: Arc<AtomicBool>,
    pub clock: Arc<dyn Clock>,
    pub weather: Option<Arc<dyn WeatherGate>>,
    pub repository: Arc<dyn Repository>,
}

/// Waiters of one scheduler run and the token that cancels them
pub(crate) struct SchedulerRunState {
    token: CancellationToken,
    waiters: Vec<JoinHandle<()>>,
}

impl SchedulerRunState {
    /// Spawn a start and a stop waiter for every active task
    pub fn spawn(ctx: &FiringContext, tasks: &[IrrigationTask]) -> Self {
        let token = CancellationToken::new();
        let mut waiters = Vec::new();

        for task in tasks.iter().filter(|t| t.is_active) {
            for (transition, at) in [(Transition::Start, task.start), (Transition::Stop, task.stop)] {
                let waiter = Waiter {
                    ctx: ctx.clone(),
                    token: token.clone(),
                    task_id: task.id,
                    task_name: task.name.clone(),
                    transition,
                    at,
                };
                waiters.push(tokio::spawn(waiter.run()));
            }
        }

        debug!(waiters = waiters.len(), "Scheduler waiters spawned");
        Self { token, waiters }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Cancel every waiter and wait until none of them is running, including
    /// a firing that was already in progress.
    pub async fn cancel(self) {
        self.token.cancel();
        for waiter in self.waiters {
            if let Err(e) = waiter.await {
                if e.is_panic() {
                    error!("Scheduler waiter panicked: {}", e);
                }
            }
        }
    }
}

struct Waiter {
    ctx: FiringContext,
    token: CancellationToken,
    task_id: TaskId,
    task_name: String,
    transition: Transition,
    at: NaiveTime,
}

impl Waiter {
    async fn run(self) {
        loop {
            if self.token.is_cancelled() {
                break;
            }

            let wait = time_until(self.ctx.clock.now(), self.at);
            debug!(
                task = %self.task_name,
                transition = %self.transition,
                wait_secs = wait.as_secs(),
                "Waiting for next trigger"
            );

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match fire(&self.ctx, &self.token, self.task_id, self.transition).await {
                Ok(reports) => {
                    for report in reports.iter().filter(|r| !r.is_ok()) {
                        warn!(
                            task = %self.task_name,
                            transition = %self.transition,
                            "Device did not follow the trigger: {}",
                            report
                        );
                    }
                }
                Err(e) => {
                    error!(
                        task = %self.task_name,
                        transition = %self.transition,
                        "Trigger failed: {}",
                        e
                    );
                }
            }
        }

        debug!(task = %self.task_name, transition = %self.transition, "Waiter stopped");
    }
}

/// Fire one transition of one task. A cancelled or disabled scheduler fires
/// nothing and returns no reports.
pub(crate) async fn fire(
    ctx: &FiringContext,
    token: &CancellationToken,
    task_id: TaskId,
    transition: Transition,
) -> Result<Vec<DeviceReport>, RigError> {
    match transition {
        Transition::Start => fire_start(ctx, token, task_id).await,
        Transition::Stop => fire_stop(ctx, token, task_id).await,
    }
}

async fn fire_start(
    ctx: &FiringContext,
    token: &CancellationToken,
    task_id: TaskId,
) -> Result<Vec<DeviceReport>, RigError> {
    if !ctx.enabled.load(Ordering::SeqCst) {
        debug!(task = task_id, "Scheduler disabled, skipping start");
        return Ok(Vec::new());
    }

    let use_weather = ctx.state.lock().await.settings.use_weather_assistant();
    if use_weather {
        let water = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Vec::new()),
            water = weather::should_water(
                ctx.weather.as_deref(),
                ctx.repository.as_ref(),
                ctx.clock.now(),
            ) => water,
        };
        if !water {
            info!(task = task_id, "Weather assistant says no watering is needed");
            return Ok(Vec::new());
        }
    }

    let mut guard = ctx.state.lock().await;
    if token.is_cancelled() {
        return Ok(Vec::new());
    }

    let state = &mut *guard;
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| RigError::not_found(format!("Task {} no longer exists", task_id)))?;
    if task.devices.is_empty() {
        info!(task = %task.name, "Task has no valves, the Pump stays off");
        return Ok(Vec::new());
    }
    info!(task = %task.name, valves = task.devices.len(), "Starting irrigation");
    interlock::open_valves(&mut state.devices, &task.devices)
}

async fn fire_stop(
    ctx: &FiringContext,
    token: &CancellationToken,
    task_id: TaskId,
) -> Result<Vec<DeviceReport>, RigError> {
    let mut guard = ctx.state.lock().await;
    if token.is_cancelled() {
        return Ok(Vec::new());
    }

    let state = &mut *guard;
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| RigError::not_found(format!("Task {} no longer exists", task_id)))?;
    let drain = state.settings.pump_stop_delay();
    info!(task = %task.name, valves = task.devices.len(), "Stopping irrigation");
    interlock::close_valves(&mut state.devices, &task.devices, drain).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_time_until_later_today() {
        assert_eq!(time_until(at(10, 59, 0), time(11, 0)), Duration::from_secs(60));
    }

    #[test]
    fn test_time_until_rolls_over_past_and_exact() {
        assert_eq!(
            time_until(at(12, 0, 0), time(11, 0)),
            Duration::from_secs(23 * 3600)
        );
        assert_eq!(
            time_until(at(11, 0, 0), time(11, 0)),
            Duration::from_secs(24 * 3600)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchored_clock_follows_tokio_time() {
        let clock = AnchoredClock::new(at(10, 0, 0));
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), at(10, 1, 30));
    }
}
