//! Integration tests for TOML configuration
//!
//! Unit tests for individual functions are located in the respective module files.

use irrigo::cli::RigConfig;
use irrigo::weather::OpenMeteoGate;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_full_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("irrigo.toml");
    fs::write(
        &config_path,
        r#"
[gpio]
mock = false
sysfs_root = "/tmp/fake-gpio"

[storage]
state_file = "/var/lib/irrigo/state.json"

[weather]
latitude = 52.23
longitude = 21.01
endpoint = "http://127.0.0.1:8080"
geolocation_endpoint = "http://127.0.0.1:8081/json/"
timeout_secs = 3
rain_threshold_mm = 4.5

[logging]
filter = "irrigo=debug"
"#,
    )
    .unwrap();

    let config = RigConfig::from_toml_file(&config_path).unwrap();
    assert!(!config.gpio.mock);
    assert_eq!(config.gpio.sysfs_root, PathBuf::from("/tmp/fake-gpio"));
    assert_eq!(
        config.storage.state_file,
        Some(PathBuf::from("/var/lib/irrigo/state.json"))
    );
    assert_eq!(config.logging.filter.as_deref(), Some("irrigo=debug"));

    let settings = config.weather.open_meteo();
    assert_eq!(settings.timeout, Duration::from_secs(3));
    assert_eq!(settings.rain_threshold_mm, 4.5);
    assert_eq!(settings.geolocation_endpoint, "http://127.0.0.1:8081/json/");
    assert!(settings.location.is_some());

    let gate = OpenMeteoGate::new(settings).unwrap();
    assert_eq!(gate.settings().endpoint, "http://127.0.0.1:8080");
}

#[test]
fn test_default_config_written_and_read_back() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join(".irrigo").join("config.toml");

    RigConfig::default().to_toml_file(&config_path).unwrap();
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[gpio]"));
    assert!(content.contains("mock = true"));

    let loaded = RigConfig::from_toml_file(&config_path).unwrap();
    assert_eq!(loaded, RigConfig::default());
    assert!(loaded.weather.open_meteo().location.is_none());
}

#[test]
fn test_empty_file_uses_defaults() {
    assert_eq!(RigConfig::from_toml_str("").unwrap(), RigConfig::default());
}

#[test]
fn test_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    assert!(RigConfig::from_toml_file(temp_dir.path().join("absent.toml")).is_err());
}
