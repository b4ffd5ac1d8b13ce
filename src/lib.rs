//! # Irrigo
//!
//! Scheduling and interlock engine for a small irrigation rig: one pump, a
//! handful of solenoid valves, and daily watering tasks that open and close
//! groups of valves.
//!
//! ## Architecture Overview
//!
//! - **[`device`]**: GPIO handles (sysfs or simulated) and the in-memory device set
//! - **[`task`]**: The [`TaskManager`] facade, the pump/valve interlock and the daily scheduler
//! - **[`repository`]**: Durable storage for devices, tasks, settings and weather predictions
//! - **[`weather`]**: Optional forecast gate consulted before scheduled watering
//! - **[`cli`]**: Argument parsing and configuration discovery
//!
//! ## Safety rules
//!
//! - The pump is never running while every valve is closed.
//! - Opening valves starts the pump first; if the pump does not come up, no valve opens.
//! - Stopping the pump waits for the line to drain before the last valves close.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use irrigo::device::{HandleFactory, NewValve, SimulatedBoard};
//! use irrigo::repository::FileRepository;
//! use irrigo::task::{NewTask, TaskManager};
//! use chrono::NaiveTime;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = TaskManager::new(
//!         Arc::new(FileRepository::in_memory()),
//!         HandleFactory::simulated(Arc::new(SimulatedBoard::new())),
//!     );
//!     manager.initialize().await;
//!
//!     manager.add_pump(5).await;
//!     let valve = manager
//!         .add_valve(NewValve { name: "Lawn".into(), pin_no: 17 })
//!         .await;
//!
//!     manager
//!         .add_task(NewTask {
//!             name: "Morning".into(),
//!             start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
//!             stop: NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
//!             period: Default::default(),
//!             is_active: true,
//!             device_ids: valve.result.map(|v| vec![v.id]).unwrap_or_default(),
//!         })
//!         .await;
//!
//!     println!("{:?}", manager.run_scheduler().await);
//! }
//! ```

/// Pin handles and the device registry.
pub mod device;

/// Task management, interlock and scheduling.
pub mod task;

/// Durable storage behind the manager.
pub mod repository;

/// Forecast-based watering gate.
pub mod weather;

/// Environment constants and path utilities.
///
/// Centralizes file names, directories and hardware defaults used throughout
/// the application.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use device::{DeviceKind, DeviceReport, DeviceView, HandleFactory, PinState};
pub use repository::{FileRepository, Repository, RepositoryError};
pub use task::{Outcome, RigError, Setting, SettingKey, StatusCode, TaskManager, TaskView};
pub use weather::{OpenMeteoGate, WeatherGate, WeatherPrediction};
