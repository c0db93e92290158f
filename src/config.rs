//! Scan engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/scan.toml` (base configuration)
//! 2. Environment variables (prefixed with `DAQ_SCAN_`, sections split on `__`)
//!
//! Every field has a default, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use daq_scan::config::ScanConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScanConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::OutputFormat;

/// Top-level scan engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Chain driver settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Log span close events, with their busy and idle time
    #[serde(default)]
    pub log_spans: bool,
}

/// Chain driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound applied to lifecycle calls of objects that declare no timeout of their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    /// Bound on the completion wait of a continuous (hardware-synchronous) master
    #[serde(default = "default_continuous_timeout")]
    pub continuous_timeout_ms: u64,
    /// Prepare every level concurrently instead of level by level
    #[serde(default)]
    pub parallel_prepare: bool,
}

/// Watchdog configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Period used when the watchdog does not declare its own timeout
    #[serde(default = "default_watchdog_timeout")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "daq-scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_continuous_timeout() -> u64 {
    60_000
}

fn default_watchdog_timeout() -> u64 {
    1_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
            log_spans: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: None,
            continuous_timeout_ms: default_continuous_timeout(),
            parallel_prepare: false,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_watchdog_timeout(),
        }
    }
}

impl EngineConfig {
    /// Default per-call bound, if any
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Completion bound of a continuous master
    pub fn continuous_timeout(&self) -> Duration {
        Duration::from_millis(self.continuous_timeout_ms)
    }
}

impl WatchdogConfig {
    /// Default watchdog period
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ScanConfig {
    /// Load configuration from config/scan.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix DAQ_SCAN_
    /// Example: DAQ_SCAN_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/scan.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_SCAN_").split("__"))
            .extract()
    }

    /// Render as TOML, e.g. to write the effective configuration next to scan data
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.engine.call_timeout_ms == Some(0) {
            return Err("engine.call_timeout_ms must be greater than 0".to_string());
        }

        if self.engine.continuous_timeout_ms == 0 {
            return Err("engine.continuous_timeout_ms must be greater than 0".to_string());
        }

        if self.watchdog.timeout_ms == 0 {
            return Err("watchdog.timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}
