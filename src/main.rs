//! CLI Entry Point for log2bin
//!
//! Captures a serial byte stream into a timestamped binary file until
//! interrupted with Ctrl+C.
//!
//! # Usage
//!
//! Capture from hardware:
//! ```bash
//! log2bin -c COM7 -b 12000000 -o logs -s bench
//! ```
//!
//! Port, baud rate and output file in one argument:
//! ```bash
//! log2bin -p /dev/ttyUSB0:12000000:/data/capture.bin
//! ```
//!
//! Run against the synthetic source:
//! ```bash
//! log2bin --simulate -o logs
//! ```
//!
//! Flags override `log2bin.toml` (next to the executable, or `--config`) and
//! `LOG2BIN_*` environment variables.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log2bin::config::{
    default_config_path, CaptureConfig, ConfigOverrides, LoggingOverrides, OutputOverrides,
    PortSpec, SourceOverrides,
};
use log2bin::source::mock::{MockScript, MockSource};
use log2bin::source::IngestionSource;
use log2bin::tracing_setup::{self, OutputFormat};
use log2bin::{CaptureSession, ShutdownReason};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bytes per delivery from the simulated source.
const SIMULATED_CHUNK_BYTES: usize = 4096;
/// Pause between simulated deliveries.
const SIMULATED_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Parser, Debug)]
#[command(name = "log2bin")]
#[command(version, about = "Capture a serial byte stream to a binary file", long_about = None)]
struct Cli {
    /// Serial port to capture from (e.g. COM7, /dev/ttyUSB0)
    #[arg(short = 'c', long = "com-port")]
    com_port: Option<String>,

    /// Line rate in baud
    #[arg(short = 'b', long = "baud-rate")]
    baud_rate: Option<u32>,

    /// PORT:BAUD[:PATH] in one argument; PATH is the exact output file
    #[arg(short = 'p', long = "port-config", conflicts_with_all = ["com_port", "baud_rate"])]
    port_config: Option<PortSpec>,

    /// Directory receiving the timestamped capture file
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Tag appended to the generated file name
    #[arg(short = 's', long)]
    suffix: Option<String>,

    /// Write to this exact file instead of a generated name
    #[arg(long)]
    output: Option<PathBuf>,

    /// Configuration file (defaults to log2bin.toml next to the executable)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture a synthetic byte pattern instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<OutputFormat>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let spec = self.port_config.as_ref();
        ConfigOverrides {
            source: SourceOverrides {
                port: self
                    .com_port
                    .clone()
                    .or_else(|| spec.map(|s| s.port.clone())),
                baud_rate: self.baud_rate.or(spec.map(|s| s.baud_rate)),
                simulate: self.simulate.then_some(true),
            },
            output: OutputOverrides {
                dir: self.output_dir.clone(),
                suffix: self.suffix.clone(),
                file: self
                    .output
                    .clone()
                    .or_else(|| spec.and_then(|s| s.file.clone())),
            },
            logging: LoggingOverrides {
                level: self.log_level.clone(),
                format: self.log_format,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("log2bin: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = CaptureConfig::load_with(&config_path, cli.overrides())
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    config.validate()?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let path = config.resolve_output_path(Local::now())?;
    info!(
        port = %config.source.port,
        baud_rate = config.source.baud_rate,
        simulate = config.source.simulate,
        path = %path.display(),
        "log2bin starting"
    );

    let session = CaptureSession::new(&config, path, build_source(&config)?);
    let trigger = session.shutdown_trigger();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                trigger.interrupt();
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
        }
    });

    let report = tokio::task::spawn_blocking(move || session.run())
        .await
        .context("capture task panicked")??;

    if let ShutdownReason::Fatal(e) = &report.reason {
        error!(kind = e.kind(), error = %e, "capture ended with a fatal error");
    }
    if !report.writer_terminated {
        warn!("writer did not finish draining before exit");
    }
    Ok(report.exit_code())
}

fn build_source(config: &CaptureConfig) -> Result<Box<dyn IngestionSource>> {
    if config.source.simulate {
        let script = MockScript::counting(SIMULATED_CHUNK_BYTES, SIMULATED_INTERVAL);
        return Ok(Box::new(MockSource::new().with_script(script)));
    }
    hardware_source()
}

#[cfg(feature = "serial")]
fn hardware_source() -> Result<Box<dyn IngestionSource>> {
    Ok(Box::new(log2bin::source::serial::SerialSource::new()))
}

#[cfg(not(feature = "serial"))]
fn hardware_source() -> Result<Box<dyn IngestionSource>> {
    anyhow::bail!("built without the `serial` feature; use --simulate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_config_fills_port_baud_and_file() {
        let cli = Cli::parse_from(["log2bin", "-p", "/dev/ttyUSB0:12000000:/data/capture.bin"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.source.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(overrides.source.baud_rate, Some(12_000_000));
        assert_eq!(
            overrides.output.file,
            Some(PathBuf::from("/data/capture.bin"))
        );
    }

    #[test]
    fn explicit_output_wins_over_port_config_path() {
        let cli = Cli::parse_from(["log2bin", "-p", "COM7:9600:a.bin", "--output", "b.bin"]);
        assert_eq!(cli.overrides().output.file, Some(PathBuf::from("b.bin")));
    }

    #[test]
    fn port_config_conflicts_with_separate_flags() {
        assert!(Cli::try_parse_from(["log2bin", "-p", "COM7:9600", "-c", "COM8"]).is_err());
        assert!(Cli::try_parse_from(["log2bin", "-p", "COM7:9600", "-b", "115200"]).is_err());
        assert!(Cli::try_parse_from(["log2bin", "-p", "COM7"]).is_err());
    }

    #[test]
    fn simulate_needs_no_baud_rate() {
        let cli = Cli::parse_from(["log2bin", "--simulate", "-o", "logs"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.source.simulate, Some(true));
        assert_eq!(overrides.source.baud_rate, None);
    }
}
