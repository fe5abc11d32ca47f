//! Core functionality shared by the Prism crates
//!
//! Error types, category logging and configuration. The GPU object model and
//! the transfer utilities live in `prism-video`.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ConfigManager, LoggingConfig, PrismConfig, TransferConfig};
pub use error::{ErrorContext, PrismError, Result};
pub use logging::{LogCategory, LogLevel};

/// Framework version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging and the global configuration
pub fn init_with(config: PrismConfig) -> Result<&'static ConfigManager> {
    logging::init(&config.logging);
    let manager = config::init_config_with(config);

    tracing::info!("Prism core v{} initialized", VERSION);
    Ok(manager)
}

/// Initialize with the default configuration
pub fn init() -> Result<&'static ConfigManager> {
    init_with(PrismConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = init().unwrap() as *const ConfigManager;
        let second = init().unwrap() as *const ConfigManager;
        assert_eq!(first, second);
    }
}
