//! Tracing setup for applications embedding the scan engine.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! left to the host. [`init`] and [`init_from_config`] build the usual
//! `tracing-subscriber` registry (env filter plus a pretty, compact or JSON
//! formatter).
//!
//! # Example
//! ```no_run
//! use daq_scan::{config::ScanConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScanConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(scan = "ascan", "engine ready");
//! # Ok(())
//! # }
//! ```

use crate::config::ScanConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event, for log aggregation
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit an event when a span closes, with its busy and idle time.
    /// `Scan::run` is instrumented, so this times whole scans.
    pub span_events: bool,
    /// ANSI colors, pretty format only
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            span_events: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options with the given level
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from the `[application]` section
    pub fn from_scan_config(config: &ScanConfig) -> Result<Self, String> {
        let application = &config.application;
        Ok(Self::new(parse_log_level(&application.log_level)?)
            .with_format(application.log_format)
            .with_span_events(application.log_spans))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from the engine configuration
pub fn init_from_config(config: &ScanConfig) -> Result<(), String> {
    init(LoggingConfig::from_scan_config(config)?)
}

/// Install a global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `Ok(())`
/// when a global subscriber is already installed, as happens in tests.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer().with_span_events(span_events);
    let fmt_layer = match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    };

    Registry::default()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
