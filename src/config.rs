//! Application configuration
//!
//! Loads the YAML file read by the `helios` binary: logging, the default
//! MQTT broker and the named provider definitions that are polled.

mod defaults;

use crate::error::{HeliosError, Result};
use crate::mqtt::BrokerConfig;
use crate::provider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Broker used by MQTT providers that do not name their own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<BrokerConfig>,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Providers read on every poll, keyed by display name
    pub providers: BTreeMap<String, ProviderEntry>,
}

/// One polled provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Value type to read: float, int, string or bool
    #[serde(default = "defaults::capability")]
    pub capability: String,

    #[serde(flatten)]
    pub config: provider::Config,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARNING, ERROR)
    pub level: String,

    /// Console level, defaults to `level`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_level: Option<String>,

    /// File level, defaults to `level`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_level: Option<String>,

    /// Log file path or directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

const CAPABILITIES: [&str; 4] = ["float", "int", "string", "bool"];

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load the first configuration found in the default locations
    pub fn load() -> Result<Self> {
        let default_paths = [
            "helios_config.yaml",
            "/data/helios_config.yaml",
            "/etc/helios/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(AppConfig::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(HeliosError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        crate::logging::parse_log_level(&self.logging.level)
            .map_err(|_| HeliosError::validation("logging.level", "Unknown log level"))?;

        if let Some(mqtt) = &self.mqtt
            && !mqtt.is_empty()
        {
            crate::mqtt::parse_broker(&mqtt.broker)
                .map_err(|e| HeliosError::validation("mqtt.broker".to_string(), e.to_string()))?;
        }

        for (name, entry) in &self.providers {
            let capability = entry.capability.to_lowercase();
            if !CAPABILITIES.contains(&capability.as_str()) {
                return Err(HeliosError::validation(
                    format!("providers.{}.capability", name),
                    format!("Must be one of {}", CAPABILITIES.join(", ")),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert!(config.mqtt.is_none());
        assert!(config.providers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(HeliosError::Validation { .. })
        ));

        let mut config = AppConfig::default();
        config.logging.level = "LOUD".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_entries() {
        let yaml = r#"
poll_interval_ms: 1000
mqtt:
  broker: localhost:1883
providers:
  grid:
    source: mqtt
    topic: meter/power
  enabled:
    capability: bool
    type: const
    value: true
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers["grid"].capability, "float");
        assert_eq!(config.providers["grid"].config.source, "mqtt");
        assert_eq!(config.providers["enabled"].capability, "bool");
        assert_eq!(config.providers["enabled"].config.source, "const");
        assert!(config.providers["enabled"].config.get("capability").is_none());
    }

    #[test]
    fn test_invalid_capability() {
        let yaml = "providers:\n  x:\n    capability: decimal\n    source: const\n    value: 1\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("providers.x.capability"));
    }
}
