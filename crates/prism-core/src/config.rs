//! Configuration system for the Prism HAL

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::error::{ErrorContext, PrismError, Result};

/// Global configuration for Prism
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrismConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Property transfer scheduling settings
    pub transfer: TransferConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Category-specific log levels (category name -> level string)
    pub category_levels: HashMap<String, String>,
    /// Rate limiting duration in seconds
    pub rate_limit_seconds: u64,
    /// Maximum number of messages before rate limiting kicks in
    pub max_rate_limit_count: u32,
    /// Install a `tracing-subscriber` fmt layer on init
    pub install_subscriber: bool,
}

/// Property pool transfer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Number of descriptor sets pre-allocated for transfer passes
    pub descriptor_cache_size: u32,
    /// Hard cap on properties serviced by a single dispatch
    pub max_properties_per_dispatch: u32,
    /// Lower bound for staging sub-allocation alignment
    pub min_staging_alignment: u32,
    /// Default blocking budget for staging allocations, in milliseconds
    pub default_upload_timeout_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut category_levels = HashMap::new();

        category_levels.insert("core".to_string(), "info".to_string());
        category_levels.insert("device".to_string(), "info".to_string());
        category_levels.insert("descriptor".to_string(), "warn".to_string());
        category_levels.insert("transfer".to_string(), "info".to_string());
        category_levels.insert("allocator".to_string(), "warn".to_string());
        category_levels.insert("backend".to_string(), "warn".to_string());

        Self {
            category_levels,
            rate_limit_seconds: 5,
            max_rate_limit_count: 10,
            install_subscriber: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            descriptor_cache_size: 32,
            max_properties_per_dispatch: 128,
            min_staging_alignment: 256,
            default_upload_timeout_ms: 50,
        }
    }
}

impl PrismConfig {
    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            PrismError::configuration_with_context(
                format!("invalid configuration: {}", e),
                ErrorContext::new("parse", "config"),
            )
        })
    }

    /// Serialize the configuration to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            PrismError::configuration(format!("cannot serialize configuration: {}", e))
        })
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| match e {
            PrismError::Configuration { message, context } => PrismError::Configuration {
                message,
                context: context.map(|c| c.with_metadata("path", path.display().to_string())),
            },
            other => other,
        })
    }

    /// Write the configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Global configuration manager
pub struct ConfigManager {
    config: Arc<RwLock<PrismConfig>>,
}

impl ConfigManager {
    /// Create a new configuration manager with default settings
    pub fn new() -> Self {
        Self::with_config(PrismConfig::default())
    }

    /// Create a configuration manager with custom config
    pub fn with_config(config: PrismConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Get a copy of the current configuration
    pub fn get_config(&self) -> PrismConfig {
        self.config.read().clone()
    }

    /// Update the configuration
    pub fn update_config<F>(&self, updater: F)
    where
        F: FnOnce(&mut PrismConfig),
    {
        let mut config = self.config.write();
        updater(&mut config);
    }

    /// Get the current logging configuration
    pub fn get_logging_config(&self) -> LoggingConfig {
        self.config.read().logging.clone()
    }

    /// Get the current transfer configuration
    pub fn get_transfer_config(&self) -> TransferConfig {
        self.config.read().transfer.clone()
    }

    /// Set log level for a specific category
    pub fn set_category_level(&self, category: &str, level: &str) {
        self.update_config(|config| {
            config
                .logging
                .category_levels
                .insert(category.to_string(), level.to_string());
        });
    }

    /// Get log level for a specific category
    pub fn get_category_level(&self, category: &str) -> Option<String> {
        self.config.read().logging.category_levels.get(category).cloned()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

static CONFIG_MANAGER: OnceLock<ConfigManager> = OnceLock::new();

/// Initialize the global configuration manager
pub fn init_config() -> &'static ConfigManager {
    CONFIG_MANAGER.get_or_init(ConfigManager::new)
}

/// Initialize the global configuration manager with custom config
pub fn init_config_with(config: PrismConfig) -> &'static ConfigManager {
    CONFIG_MANAGER.get_or_init(|| ConfigManager::with_config(config))
}

/// Get the global configuration manager
pub fn get_config_manager() -> Option<&'static ConfigManager> {
    CONFIG_MANAGER.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = PrismConfig::default();

        assert_eq!(config.transfer.descriptor_cache_size, 32);
        assert_eq!(config.transfer.max_properties_per_dispatch, 128);
        assert_eq!(
            config.logging.category_levels.get("allocator"),
            Some(&"warn".to_string())
        );
    }

    #[test]
    fn test_json_round_trip_keeps_overrides() {
        let mut config = PrismConfig::default();
        config.transfer.descriptor_cache_size = 4;
        config.transfer.default_upload_timeout_ms = 1;

        let parsed = PrismConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed = PrismConfig::from_json(r#"{ "transfer": { "descriptor_cache_size": 8 } }"#)
            .unwrap();

        assert_eq!(parsed.transfer.descriptor_cache_size, 8);
        assert_eq!(parsed.transfer.min_staging_alignment, 256);
        assert_eq!(parsed.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        let err = PrismConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, PrismError::Configuration { .. }));
    }

    #[test]
    fn test_config_manager() {
        let manager = ConfigManager::new();

        manager.set_category_level("transfer", "trace");
        assert_eq!(
            manager.get_category_level("transfer"),
            Some("trace".to_string())
        );

        manager.update_config(|c| c.transfer.descriptor_cache_size = 2);
        assert_eq!(manager.get_transfer_config().descriptor_cache_size, 2);
    }
}
