//! Logging for the capture binary.
//!
//! Events go to stderr so a capture can be piped or redirected without mixing
//! log lines into anything else. The configured level applies to `log2bin`
//! itself; dependencies are held at `warn`. `RUST_LOG`, when set, replaces the
//! whole filter.
//!
//! Writer threads are named `capture-writer-<generation>`, and thread names
//! are always included so restarts are easy to follow.
//!
//! # Example
//! ```no_run
//! use log2bin::{config::CaptureConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::load_from("log2bin.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! info!(port = %config.source.port, "capture starting");
//! # Ok(())
//! # }
//! ```

use crate::config::{CaptureConfig, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored when stderr is a terminal
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    /// Level for events emitted by this crate
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Emit ANSI colors (pretty format only)
    pub ansi: bool,
}

impl LogSettings {
    /// Resolve `[logging]`. Colors follow whether stderr is a terminal.
    pub fn from_config(config: &LoggingConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format,
            ansi: std::io::stderr().is_terminal(),
        })
    }

    /// Filter used when `RUST_LOG` is not set.
    pub fn default_directives(&self) -> String {
        format!("warn,log2bin={}", self.level.as_str().to_lowercase())
    }
}

/// Initialize logging from the capture configuration.
pub fn init_from_config(config: &CaptureConfig) -> Result<(), String> {
    init(LogSettings::from_config(&config.logging)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())`, which keeps it safe to call from tests.
pub fn init(settings: LogSettings) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.default_directives()));

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true);
    let fmt_layer = match settings.format {
        OutputFormat::Pretty => base.pretty().with_ansi(settings.ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_current_span(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!("Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error")
    })
}
