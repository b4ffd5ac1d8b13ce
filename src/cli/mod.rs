//! CLI-specific functionality for the irrigation controller
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, Commands, ExecutionMode, RunConfig};
pub use config::{
    ConfigDiscovery, ConfigError, GpioConfig, LoggingConfig, RigConfig, StorageConfig,
    WeatherConfig,
};
