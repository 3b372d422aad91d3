//! Capture configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. Built-in defaults ([`CaptureConfig::default`])
//! 2. `log2bin.toml` (or the file passed with `--config`)
//! 3. Environment variables prefixed with `LOG2BIN_`, nested keys separated by `__`
//! 4. Command-line overrides
//!
//! # Example
//! ```no_run
//! use log2bin::config::CaptureConfig;
//!
//! let config = CaptureConfig::load_from("log2bin.toml")?;
//! config.validate()?;
//! println!("Capturing {} @ {} baud", config.source.port, config.source.baud_rate);
//! # Ok::<(), log2bin::error::CaptureError>(())
//! ```

use crate::error::{AppResult, CaptureError};
use crate::tracing_setup::OutputFormat;
use chrono::{DateTime, Local};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up next to the executable.
pub const DEFAULT_CONFIG_FILE: &str = "log2bin.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LOG2BIN_";

/// Top-level capture configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Upstream ingestion source settings
    #[serde(default)]
    pub source: SourceConfig,
    /// Output file settings
    #[serde(default)]
    pub output: OutputConfig,
    /// Queue, writer and supervisor timings
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Port identifier (e.g. "COM7", "/dev/ttyUSB0")
    #[serde(default)]
    pub port: String,
    /// Line rate in baud
    #[serde(default)]
    pub baud_rate: u32,
    /// Use the synthetic mock source instead of real hardware
    #[serde(default)]
    pub simulate: bool,
}

/// Output file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving timestamped capture files
    #[serde(default)]
    pub dir: PathBuf,
    /// Optional tag appended to the generated file name
    #[serde(default)]
    pub suffix: Option<String>,
    /// Explicit output file; bypasses name generation when set
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Pipeline timings and bounds.
///
/// Durations accept humantime strings (`"500ms"`, `"5s"`, `"1m"`) in TOML and
/// in `LOG2BIN_PIPELINE__*` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded queue capacity in chunks
    pub queue_capacity: usize,
    /// Upper bound on a single consumer wait
    #[serde(with = "humantime_serde")]
    pub pop_timeout: Duration,
    /// Output open attempts before the writer fails
    pub max_open_retries: u32,
    /// Fixed delay between open attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Interval between flushes to stable storage
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Interval between liveness heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which the writer counts as hung
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Supervisor thread-liveness poll cadence
    #[serde(with = "humantime_serde")]
    pub supervisor_poll_interval: Duration,
    /// Supervisor heartbeat/status check cadence
    #[serde(with = "humantime_serde")]
    pub status_check_interval: Duration,
    /// Bounded join after unsticking a hung writer
    #[serde(with = "humantime_serde")]
    pub hang_join_timeout: Duration,
    /// First bounded join during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_join_timeout: Duration,
    /// Second bounded join during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_retry_join_timeout: Duration,
    /// Replacement writers allowed per session
    pub max_restarts: u32,
    /// Delay before the first restart
    #[serde(with = "humantime_serde")]
    pub restart_backoff_first: Duration,
    /// Cap on the delay between restarts
    #[serde(with = "humantime_serde")]
    pub restart_backoff_max: Duration,
    /// Growth factor applied per restart
    pub restart_backoff_factor: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            pop_timeout: Duration::from_millis(500),
            max_open_retries: 3,
            retry_backoff: Duration::from_secs(1),
            flush_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            supervisor_poll_interval: Duration::from_secs(5),
            status_check_interval: Duration::from_secs(30),
            hang_join_timeout: Duration::from_secs(2),
            shutdown_join_timeout: Duration::from_secs(5),
            shutdown_retry_join_timeout: Duration::from_secs(2),
            max_restarts: 5,
            restart_backoff_first: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(60),
            restart_backoff_factor: 2.0,
        }
    }
}

impl PipelineConfig {
    /// Validate timings and bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.max_open_retries == 0 {
            return Err("max_open_retries must be at least 1".into());
        }

        let intervals = [
            ("pop_timeout", self.pop_timeout),
            ("flush_interval", self.flush_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("supervisor_poll_interval", self.supervisor_poll_interval),
            ("status_check_interval", self.status_check_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            ));
        }
        if !self.restart_backoff_factor.is_finite() || self.restart_backoff_factor < 1.0 {
            return Err(format!(
                "restart_backoff_factor must be >= 1.0, got {}",
                self.restart_backoff_factor
            ));
        }
        if self.restart_backoff_max < self.restart_backoff_first {
            return Err("restart_backoff_max must not be below restart_backoff_first".into());
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// Values supplied on the command line. `None` leaves the layered value untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    /// `[source]` overrides.
    pub source: SourceOverrides,
    /// `[output]` overrides.
    pub output: OutputOverrides,
    /// `[logging]` overrides.
    pub logging: LoggingOverrides,
}

/// Command-line values for `[source]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceOverrides {
    /// `-c`, or the port part of `-p`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// `-b`, or the baud part of `-p`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    /// `--simulate`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulate: Option<bool>,
}

/// Command-line values for `[output]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputOverrides {
    /// `-o`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// `-s`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    /// `--output`, or the path part of `-p`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Command-line values for `[logging]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoggingOverrides {
    /// `--log-level`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// `--log-format`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
}

/// Combined `PORT:BAUD[:PATH]` source specification.
///
/// Only the first two colons separate fields, so the path may itself contain
/// colons (`COM3:12000000:C:\log\data.bin`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Port identifier
    pub port: String,
    /// Line rate in baud
    pub baud_rate: u32,
    /// Exact output file, when given
    pub file: Option<PathBuf>,
}

impl std::str::FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let port = parts.next().unwrap_or_default().trim();
        let baud = parts
            .next()
            .ok_or_else(|| format!("'{s}' is not PORT:BAUD[:PATH]"))?;
        if port.is_empty() {
            return Err(format!("'{s}' has an empty port name"));
        }
        let baud_rate = match baud.trim().parse::<u32>() {
            Ok(rate) if rate > 0 => rate,
            _ => return Err(format!("baud rate '{baud}' must be a positive integer")),
        };
        let file = match parts.next() {
            None => None,
            Some(path) if path.trim().is_empty() => {
                return Err(format!("'{s}' has an empty output path"));
            }
            Some(path) => Some(PathBuf::from(path)),
        };
        Ok(Self {
            port: port.to_string(),
            baud_rate,
            file,
        })
    }
}

impl CaptureConfig {
    /// Load defaults, then `path` (if it exists), then `LOG2BIN_*` variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::load_with(path, ConfigOverrides::default())
    }

    /// Same as [`CaptureConfig::load_from`] with command-line values merged last.
    pub fn load_with<P: AsRef<Path>>(path: P, overrides: ConfigOverrides) -> AppResult<Self> {
        let config = Self::figment(path.as_ref())
            .merge(Serialized::defaults(overrides))
            .extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(CaptureConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if self.source.port.trim().is_empty() && !self.source.simulate {
            return Err(CaptureError::Configuration(
                "missing source port (set source.port or pass --com-port)".into(),
            ));
        }
        if self.source.baud_rate == 0 && !self.source.simulate {
            return Err(CaptureError::Configuration(
                "baud rate must be a positive integer".into(),
            ));
        }
        if self.output.file.is_none() && self.output.dir.as_os_str().is_empty() {
            return Err(CaptureError::Configuration(
                "missing output directory (set output.dir or pass --output-dir)".into(),
            ));
        }
        if let Some(suffix) = &self.output.suffix {
            if suffix.contains(['/', '\\']) {
                return Err(CaptureError::Configuration(format!(
                    "suffix '{suffix}' must not contain path separators"
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(CaptureError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        self.pipeline.validate().map_err(CaptureError::Configuration)
    }

    /// Resolve the capture file for a session started at `started`.
    ///
    /// An explicit `output.file` wins. Otherwise the output directory is created
    /// and the name is `<YYYY-MM-DD_HHMMSS>[-<suffix>].bin`.
    pub fn resolve_output_path(&self, started: DateTime<Local>) -> AppResult<PathBuf> {
        if let Some(file) = &self.output.file {
            return Ok(file.clone());
        }

        std::fs::create_dir_all(&self.output.dir).map_err(|e| {
            CaptureError::Configuration(format!(
                "failed to create output directory {:?}: {e}",
                self.output.dir
            ))
        })?;

        let timestamp = started.format("%Y-%m-%d_%H%M%S");
        let name = match self.output.suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{timestamp}-{suffix}.bin"),
            None => format!("{timestamp}.bin"),
        };
        Ok(self.output.dir.join(name))
    }
}

/// Default config location: next to the running executable, falling back to
/// the working directory.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serial_test::serial;

    fn valid_config() -> CaptureConfig {
        CaptureConfig {
            source: SourceConfig {
                port: "COM7".into(),
                baud_rate: 12_000_000,
                simulate: false,
            },
            output: OutputConfig {
                dir: PathBuf::from("logs"),
                suffix: None,
                file: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let p = PipelineConfig::default();
        assert_eq!(p.queue_capacity, 4096);
        assert_eq!(p.max_open_retries, 3);
        assert_eq!(p.retry_backoff, Duration::from_secs(1));
        assert_eq!(p.flush_interval, Duration::from_secs(5));
        assert_eq!(p.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(p.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(p.supervisor_poll_interval, Duration::from_secs(5));
        assert_eq!(p.status_check_interval, Duration::from_secs(30));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(valid_config().validate().is_ok());

        let mut missing_port = valid_config();
        missing_port.source.port.clear();
        assert!(matches!(
            missing_port.validate(),
            Err(CaptureError::Configuration(_))
        ));

        let mut zero_baud = valid_config();
        zero_baud.source.baud_rate = 0;
        assert!(zero_baud.validate().is_err());
        zero_baud.source.simulate = true;
        assert!(zero_baud.validate().is_ok());

        let mut no_dir = valid_config();
        no_dir.output.dir = PathBuf::new();
        assert!(no_dir.validate().is_err());
        no_dir.output.file = Some(PathBuf::from("capture.bin"));
        assert!(no_dir.validate().is_ok());
    }

    #[test]
    fn test_invalid_pipeline_timings() {
        let mut config = valid_config();
        config.pipeline.heartbeat_timeout = config.pipeline.heartbeat_interval;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.pipeline.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.pipeline.restart_backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_suffix_with_separator_rejected() {
        let mut config = valid_config();
        config.output.suffix = Some("../escape".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_name_with_and_without_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let mut config = valid_config();
        config.output.dir = dir.path().join("nested");
        let plain = config.resolve_output_path(started).unwrap();
        assert_eq!(plain, dir.path().join("nested").join("2024-03-09_140507.bin"));
        assert!(dir.path().join("nested").is_dir());

        config.output.suffix = Some("test".into());
        let tagged = config.resolve_output_path(started).unwrap();
        assert_eq!(
            tagged.file_name().unwrap().to_str().unwrap(),
            "2024-03-09_140507-test.bin"
        );

        config.output.file = Some(dir.path().join("fixed.bin"));
        assert_eq!(
            config.resolve_output_path(started).unwrap(),
            dir.path().join("fixed.bin")
        );
    }

    #[test]
    #[serial]
    fn test_layering_file_env_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log2bin.toml");
        std::fs::write(
            &path,
            r#"
                [source]
                port = "COM3"
                baud_rate = 115200

                [output]
                dir = "from-file"

                [pipeline]
                queue_capacity = 128
                heartbeat_timeout = "15s"
            "#,
        )
        .unwrap();

        std::env::set_var("LOG2BIN_PIPELINE__FLUSH_INTERVAL", "250ms");
        let overrides = ConfigOverrides {
            source: SourceOverrides {
                port: Some("COM9".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let loaded = CaptureConfig::load_with(&path, overrides);
        std::env::remove_var("LOG2BIN_PIPELINE__FLUSH_INTERVAL");

        let config = loaded.unwrap();
        assert_eq!(config.source.port, "COM9");
        assert_eq!(config.source.baud_rate, 115200);
        assert_eq!(config.output.dir, PathBuf::from("from-file"));
        assert_eq!(config.pipeline.queue_capacity, 128);
        assert_eq!(config.pipeline.flush_interval, Duration::from_millis(250));
        assert_eq!(config.pipeline.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.pipeline.max_open_retries, 3);
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        let config = CaptureConfig::load_from("/definitely/not/here.toml").unwrap();
        assert_eq!(config.pipeline.queue_capacity, 4096);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_spec_parsing() {
        let spec: PortSpec = "/dev/ttyUSB0:12000000:/home/user/data.bin".parse().unwrap();
        assert_eq!(spec.port, "/dev/ttyUSB0");
        assert_eq!(spec.baud_rate, 12_000_000);
        assert_eq!(spec.file, Some(PathBuf::from("/home/user/data.bin")));

        let spec: PortSpec = r"COM3:115200:C:\log\data.bin".parse().unwrap();
        assert_eq!(spec.port, "COM3");
        assert_eq!(spec.file, Some(PathBuf::from(r"C:\log\data.bin")));

        let spec: PortSpec = "COM7:9600".parse().unwrap();
        assert_eq!(spec.baud_rate, 9600);
        assert_eq!(spec.file, None);
    }

    #[test]
    fn test_port_spec_rejects_malformed_input() {
        assert!("COM7".parse::<PortSpec>().is_err());
        assert!(":9600".parse::<PortSpec>().is_err());
        assert!("COM7:0".parse::<PortSpec>().is_err());
        assert!("COM7:fast".parse::<PortSpec>().is_err());
        assert!("COM7:9600:".parse::<PortSpec>().is_err());
    }
}
