//! Environment constants and path utilities for the irrigation controller.
//!
//! Centralizes file names, directories and hardware defaults used throughout
//! the application.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git)
pub const IRRIGO_DIR_NAME: &str = ".irrigo";

/// Configuration file name inside an application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "irrigo.toml";

/// System-wide configuration file
pub const SYSTEM_CONFIG_FILE: &str = "/etc/irrigo/config.toml";

/// Default tracing filter when neither `RUST_LOG` nor the configuration sets one
pub const DEFAULT_LOG_FILTER: &str = "irrigo=info";

/// Drain delay between stopping the pump and closing the last valves
pub const DEFAULT_PUMP_STOP_DELAY_MS: u64 = 3000;

/// Linux sysfs GPIO interface
pub const DEFAULT_SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// How often to look for the pin directory after exporting a line
pub const SYSFS_EXPORT_RETRIES: u32 = 20;

/// Pause between those lookups; udev may need a moment to create the files
pub const SYSFS_EXPORT_WAIT_MS: u64 = 50;

/// Weather gate defaults
pub mod weather {
    pub const DEFAULT_ENDPOINT: &str = "https://api.open-meteo.com";

    /// IP geolocation service used when no coordinates are configured
    pub const DEFAULT_GEOLOCATION_ENDPOINT: &str = "http://ip-api.com/json/";

    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

    /// Forecast rain (mm per day) at or above which watering is skipped
    pub const DEFAULT_RAIN_THRESHOLD_MM: f64 = 10.0;
}

/// Build the application directory path under `root`
pub fn irrigo_dir_path(root: &Path) -> PathBuf {
    root.join(IRRIGO_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    irrigo_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    irrigo_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/pi");
        let current_dir = Path::new("/srv/garden");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/pi/.irrigo/config.toml")
        );
        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/srv/garden/.irrigo/config.toml")
        );
    }
}
