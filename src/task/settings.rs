use crate::env;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Recognized setting keys
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SettingKey {
    /// Start the scheduler together with the service
    AutostartScheduler,
    /// Drain delay between stopping the pump and closing valves, in milliseconds
    PumpStopDelay,
    /// Skip start triggers when the forecast says no watering is needed
    UseWeatherAssistant,
}

/// One stored key/value pair
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingError {
    #[error("Key not found: {0}")]
    UnknownKey(String),
    #[error("Invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: SettingKey,
        value: String,
        expected: &'static str,
    },
}

/// Settings cache held by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<Setting>,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::AutostartScheduler,
        SettingKey::PumpStopDelay,
        SettingKey::UseWeatherAssistant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::AutostartScheduler => "autostartScheduler",
            SettingKey::PumpStopDelay => "pumpStopDelay",
            SettingKey::UseWeatherAssistant => "useWeatherAssistant",
        }
    }

    pub fn default_value(&self) -> String {
        match self {
            SettingKey::AutostartScheduler => "false".to_string(),
            SettingKey::PumpStopDelay => env::DEFAULT_PUMP_STOP_DELAY_MS.to_string(),
            SettingKey::UseWeatherAssistant => "false".to_string(),
        }
    }

    /// Check that `value` parses as this key's type
    pub fn validate(&self, value: &str) -> Result<(), SettingError> {
        let valid = match self {
            SettingKey::AutostartScheduler | SettingKey::UseWeatherAssistant => {
                parse_flag(value).is_some()
            }
            SettingKey::PumpStopDelay => value.trim().parse::<u64>().is_ok(),
        };

        if valid {
            Ok(())
        } else {
            Err(SettingError::InvalidValue {
                key: *self,
                value: value.to_string(),
                expected: match self {
                    SettingKey::PumpStopDelay => "milliseconds",
                    _ => "true or false",
                },
            })
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = SettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SettingError::UnknownKey(s.to_string()))
    }
}

impl Setting {
    pub fn new(key: SettingKey, value: impl Into<String>) -> Self {
        Self {
            key: key.as_str().to_string(),
            value: value.into(),
        }
    }
}

impl Settings {
    /// Build from stored entries; recognized keys missing from storage get defaults
    pub fn from_entries(entries: Vec<Setting>) -> Self {
        let mut settings = Self { entries };
        for key in SettingKey::ALL {
            if settings.get(key).is_none() {
                settings.entries.push(Setting::new(key, key.default_value()));
            }
        }
        settings
    }

    pub fn defaults() -> Vec<Setting> {
        SettingKey::ALL
            .into_iter()
            .map(|k| Setting::new(k, k.default_value()))
            .collect()
    }

    pub fn entries(&self) -> &[Setting] {
        &self.entries
    }

    pub fn get(&self, key: SettingKey) -> Option<&Setting> {
        self.entries.iter().find(|s| s.key == key.as_str())
    }

    pub fn set(&mut self, key: SettingKey, value: String) {
        match self.entries.iter_mut().find(|s| s.key == key.as_str()) {
            Some(entry) => entry.value = value,
            None => self.entries.push(Setting::new(key, value)),
        }
    }

    pub fn autostart_scheduler(&self) -> bool {
        self.flag(SettingKey::AutostartScheduler)
    }

    pub fn use_weather_assistant(&self) -> bool {
        self.flag(SettingKey::UseWeatherAssistant)
    }

    pub fn pump_stop_delay(&self) -> Duration {
        let millis = self
            .get(SettingKey::PumpStopDelay)
            .and_then(|s| s.value.trim().parse::<u64>().ok())
            .unwrap_or(env::DEFAULT_PUMP_STOP_DELAY_MS);
        Duration::from_millis(millis)
    }

    fn flag(&self, key: SettingKey) -> bool {
        self.get(key)
            .and_then(|s| parse_flag(&s.value))
            .unwrap_or(false)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let settings = Settings::from_entries(vec![Setting::new(SettingKey::AutostartScheduler, "true")]);

        assert!(settings.autostart_scheduler());
        assert!(!settings.use_weather_assistant());
        assert_eq!(settings.pump_stop_delay(), Duration::from_millis(3000));
        assert_eq!(settings.entries().len(), 3);
    }

    #[test]
    fn test_key_parsing_and_validation() {
        assert_eq!("pumpStopDelay".parse::<SettingKey>(), Ok(SettingKey::PumpStopDelay));
        assert!(matches!(
            "rainSensor".parse::<SettingKey>(),
            Err(SettingError::UnknownKey(_))
        ));

        assert!(SettingKey::PumpStopDelay.validate("5000").is_ok());
        assert!(SettingKey::PumpStopDelay.validate("soon").is_err());
        assert!(SettingKey::UseWeatherAssistant.validate("TRUE").is_ok());
        assert!(SettingKey::UseWeatherAssistant.validate("maybe").is_err());
    }
}
