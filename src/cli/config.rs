//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./irrigo.toml or ./.irrigo/config.toml
//! 2. User config: ~/.irrigo/config.toml
//! 3. System config: /etc/irrigo/config.toml
//! 4. Built-in defaults

use crate::env;
use crate::weather::{Location, OpenMeteoSettings};
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub gpio: GpioConfig,
    pub storage: StorageConfig,
    pub weather: WeatherConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// Drive a simulated board instead of real pins
    pub mock: bool,
    pub sysfs_root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON state file; state is kept in memory only when unset
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub endpoint: String,
    /// Consulted for the location when the coordinates are not both set
    pub geolocation_endpoint: String,
    pub timeout_secs: u64,
    pub rain_threshold_mm: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `irrigo=debug`
    pub filter: Option<String>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            mock: true,
            sysfs_root: PathBuf::from(env::DEFAULT_SYSFS_GPIO_ROOT),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            latitude: None,
            longitude: None,
            endpoint: env::weather::DEFAULT_ENDPOINT.to_string(),
            geolocation_endpoint: env::weather::DEFAULT_GEOLOCATION_ENDPOINT.to_string(),
            timeout_secs: env::weather::DEFAULT_TIMEOUT_SECS,
            rain_threshold_mm: env::weather::DEFAULT_RAIN_THRESHOLD_MM,
        }
    }
}

impl WeatherConfig {
    /// Forecast gate settings. Without both coordinates the gate locates the
    /// rig by IP.
    pub fn open_meteo(&self) -> OpenMeteoSettings {
        let location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location { latitude, longitude }),
            _ => None,
        };
        OpenMeteoSettings {
            endpoint: self.endpoint.clone(),
            location,
            geolocation_endpoint: self.geolocation_endpoint.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            rain_threshold_mm: self.rain_threshold_mm,
        }
    }
}

impl RigConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save to TOML file, creating parent directories
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        fs::write(path, self.to_toml_string()?).map_err(write_error)?;
        Ok(())
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<RigConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return RigConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(RigConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_FILE));
        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME").ok().map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "✓ EXISTS"
            } else if candidate.exists() {
                "✗ NOT A FILE"
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = RigConfig::from_toml_str(
            r#"
            [gpio]
            mock = false

            [weather]
            latitude = 52.23
            longitude = 21.01
            "#,
        )
        .unwrap();

        assert!(!config.gpio.mock);
        assert_eq!(config.gpio.sysfs_root, PathBuf::from("/sys/class/gpio"));
        assert_eq!(config.storage.state_file, None);

        let gate = config.weather.open_meteo();
        assert_eq!(gate.endpoint, "https://api.open-meteo.com");
        assert_eq!(gate.timeout, Duration::from_secs(10));
        assert_eq!(
            gate.location,
            Some(Location {
                latitude: 52.23,
                longitude: 21.01
            })
        );
    }

    #[test]
    fn test_partial_coordinates_fall_back_to_ip_lookup() {
        let config = RigConfig::from_toml_str("[weather]\nlatitude = 52.23\n").unwrap();
        let gate = config.weather.open_meteo();
        assert_eq!(gate.location, None);
        assert_eq!(gate.geolocation_endpoint, "http://ip-api.com/json/");
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("irrigo.toml");

        let mut original = RigConfig::default();
        original.storage.state_file = Some(temp_dir.path().join("state.json"));
        original.logging.filter = Some("irrigo=debug".to_string());

        original.to_toml_file(&config_path).unwrap();
        let loaded = RigConfig::from_toml_file(&config_path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        assert!(matches!(
            RigConfig::from_toml_str("[gpio]\nmock = \"maybe\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_candidates() {
        let candidates = ConfigDiscovery::get_config_candidates();
        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].file_name().unwrap(), "irrigo.toml");
    }
}
