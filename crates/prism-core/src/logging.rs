//! Logging system for the Prism HAL
//!
//! Category-based filtering and rate limiting on top of `tracing`. Every
//! message that passes the filters is emitted as a `tracing` event carrying a
//! `category` field, so any subscriber sees it.

use crate::config::LoggingConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Log levels supported by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Log categories for organizing log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    Core,
    Device,
    Descriptor,
    Transfer,
    Allocator,
    Backend,
}

impl LogCategory {
    /// Convert LogCategory to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Core => "core",
            LogCategory::Device => "device",
            LogCategory::Descriptor => "descriptor",
            LogCategory::Transfer => "transfer",
            LogCategory::Allocator => "allocator",
            LogCategory::Backend => "backend",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl LogLevel {
    /// Parse a level name, case-insensitively
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Convert LogLevel to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rate limiting state for a specific category
#[derive(Debug)]
struct RateLimitState {
    last_reset: Instant,
    count: u32,
    max_count: u32,
    duration: Duration,
}

impl RateLimitState {
    fn new(max_count: u32, duration: Duration) -> Self {
        Self {
            last_reset: Instant::now(),
            count: 0,
            max_count,
            duration,
        }
    }

    fn should_allow(&mut self) -> bool {
        let now = Instant::now();

        if now.duration_since(self.last_reset) >= self.duration {
            self.last_reset = now;
            self.count = 0;
        }

        if self.count < self.max_count {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Logger configuration and state
#[derive(Debug)]
pub struct LoggerConfig {
    rate_limiters: Mutex<HashMap<String, RateLimitState>>,
    config: LoggingConfig,
}

impl LoggerConfig {
    /// Create a new logger configuration
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            rate_limiters: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Check if a log message should be allowed based on rate limiting
    pub fn should_allow_log(&self, category: &str) -> bool {
        let mut limiters = self.rate_limiters.lock();

        let limiter = limiters.entry(category.to_string()).or_insert_with(|| {
            RateLimitState::new(
                self.config.max_rate_limit_count,
                Duration::from_secs(self.config.rate_limit_seconds),
            )
        });

        limiter.should_allow()
    }

    /// Check if a log level is enabled for a category
    pub fn is_level_enabled(&self, category: &str, level: LogLevel) -> bool {
        if let Some(category_level) = self
            .config
            .category_levels
            .get(category)
            .and_then(|s| LogLevel::parse(s))
        {
            return level >= category_level;
        }

        level >= LogLevel::Info
    }

    /// Update the configuration
    pub fn update_config(&mut self, config: LoggingConfig) {
        self.config = config;
        self.rate_limiters.lock().clear();
    }
}

static LOGGER: OnceLock<Arc<RwLock<LoggerConfig>>> = OnceLock::new();

/// Initialize the logging system
///
/// Safe to call more than once; only the first call installs state.
pub fn init(config: &LoggingConfig) {
    if LOGGER
        .set(Arc::new(RwLock::new(LoggerConfig::new(config.clone()))))
        .is_err()
    {
        return;
    }

    if config.install_subscriber {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        // Another subscriber may already be installed by the host application.
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

/// Update logger configuration
pub fn update_config(config: LoggingConfig) {
    if let Some(logger) = LOGGER.get() {
        logger.write().update_config(config);
    }
}

/// Internal logging function used by the exported macros
pub fn log_internal(level: LogLevel, category: &str, message: &str, rate_limited: bool) {
    if let Some(logger) = LOGGER.get() {
        let logger = logger.read();

        if !logger.is_level_enabled(category, level) {
            return;
        }

        if rate_limited && !logger.should_allow_log(category) {
            return;
        }
    }

    match level {
        LogLevel::Trace => tracing::trace!(category, "{}", message),
        LogLevel::Debug => tracing::debug!(category, "{}", message),
        LogLevel::Info => tracing::info!(category, "{}", message),
        LogLevel::Warn => tracing::warn!(category, "{}", message),
        LogLevel::Error => tracing::error!(category, "{}", message),
    }
}

#[macro_export]
macro_rules! prism_trace {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Trace, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! prism_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Debug, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! prism_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Info, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! prism_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! prism_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! prism_warn_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category.as_str(), &format!($($arg)*), true)
    };
}

#[macro_export]
macro_rules! prism_error_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category.as_str(), &format!($($arg)*), true)
    };
}
