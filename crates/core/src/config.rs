//! Configuration management for Fleetlink.

use serde::{Deserialize, Serialize};
use std::env;
#[cfg(feature = "toml")]
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Subject common name carried by the shared bootstrap certificate.
pub const DEFAULT_REGISTER_COMMON_NAME: &str = "register";

/// Initial retry interval in seconds.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

/// Ceiling for the retry interval in seconds.
pub const DEFAULT_MAX_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub registration: RegistrationSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    pub device_id: String,
    pub retry_after_secs: u64,
    pub max_interval_secs: u64,
    pub register_common_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
            register_common_name: DEFAULT_REGISTER_COMMON_NAME.to_string(),
        }
    }
}

impl RegistrationSettings {
    /// Settings for a device with the default backoff policy.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(CoreError::Config("device_id must not be empty".to_string()));
        }
        if self.retry_after_secs == 0 {
            return Err(CoreError::Config(
                "retry_after_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_interval_secs < self.retry_after_secs {
            return Err(CoreError::Config(format!(
                "max_interval_secs ({}) is smaller than retry_after_secs ({})",
                self.max_interval_secs, self.retry_after_secs
            )));
        }
        if self.register_common_name.is_empty() {
            return Err(CoreError::Config(
                "register_common_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AgentConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CoreError::Parse(e.to_string()))
    }

    /// Apply `FLEETLINK_*` environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device_id) = lookup("FLEETLINK_DEVICE_ID") {
            self.registration.device_id = device_id;
        }
        if let Some(value) = lookup("FLEETLINK_RETRY_AFTER_SECS") {
            self.registration.retry_after_secs =
                parse_number("FLEETLINK_RETRY_AFTER_SECS", &value)?;
        }
        if let Some(value) = lookup("FLEETLINK_MAX_INTERVAL_SECS") {
            self.registration.max_interval_secs =
                parse_number("FLEETLINK_MAX_INTERVAL_SECS", &value)?;
        }
        if let Some(level) = lookup("FLEETLINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(value) = lookup("FLEETLINK_LOG_JSON") {
            self.logging.json = matches!(value.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.registration.validate()
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{} must be a number, got {:?}", key, value)))
}
