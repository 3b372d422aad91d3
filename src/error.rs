//! Custom error types for the capture pipeline.
//!
//! This module defines `CaptureError`, the single error type surfaced by the
//! library. Using the `thiserror` crate, each variant maps onto one class of
//! failure the pipeline distinguishes when deciding whether to retry, recover
//! locally, or shut the session down.
//!
//! ## Error Classes
//!
//! - **`Configuration`**: invalid port, baud rate, output path or pipeline
//!   timings. Fatal, reported before anything is opened.
//! - **`ConfigLoad`**: wraps `figment::Error` when the configuration file or
//!   environment cannot be parsed.
//! - **`UpstreamOpen`**: the ingestion source refused to open. Not retried.
//! - **`UpstreamRuntime`**: the source reported a fault through its error
//!   callback. Every such report is fatal because the source carries no
//!   severity information.
//! - **`FileOpen`** / **`FileWrite`**: output file failures after the writer's
//!   own retry and recovery attempts have been exhausted.
//! - **`RestartBudgetExhausted`**: the supervisor gave up replacing writers.
//! - **`WriterInconsistent`**: the writer thread vanished while the liveness
//!   register still claimed it was running and nothing was left to rescue.
//!
//! Queue overflow is deliberately absent: dropped chunks are logged and
//! counted, never propagated.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the capture error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Every failure the capture pipeline reports.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// A configuration source could not be read or parsed.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Loaded configuration failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The source's `open` returned a non-zero status.
    #[error("Failed to open ingestion source '{port}' (status {code})")]
    UpstreamOpen {
        /// Port the source was asked to open.
        port: String,
        /// Status code returned by the source.
        code: i32,
    },

    /// Reported through the source's error callback.
    #[error("Ingestion source error {code}: {message}")]
    UpstreamRuntime {
        /// Status code passed to the callback.
        code: i32,
        /// Message passed to the callback.
        message: String,
    },

    /// Every open attempt failed.
    #[error("Failed to open output file {path:?} after {attempts} attempts: {source}")]
    FileOpen {
        /// Output file path.
        path: PathBuf,
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: std::io::Error,
    },

    /// A write or flush failed and the append-mode reopen did not help.
    #[error("Unrecoverable write failure on {path:?}: {source}")]
    FileWrite {
        /// Output file path.
        path: PathBuf,
        /// Error from the failed operation.
        #[source]
        source: std::io::Error,
    },

    /// The restart policy allows no further writers.
    #[error("Writer restarted {restarts} times; giving up")]
    RestartBudgetExhausted {
        /// Replacement writers already spawned.
        restarts: u32,
    },

    /// Nothing left to restart for; see the module docs.
    #[error("Writer thread exited while still marked running (last error: {last_error})")]
    WriterInconsistent {
        /// Last error the writer recorded, or a placeholder.
        last_error: String,
    },

    /// The OS refused to create the writer thread.
    #[error("Failed to spawn writer thread: {0}")]
    Spawn(std::io::Error),
}

impl From<figment::Error> for CaptureError {
    fn from(value: figment::Error) -> Self {
        CaptureError::ConfigLoad(Box::new(value))
    }
}

impl CaptureError {
    /// Short machine-friendly class name used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::ConfigLoad(_) | CaptureError::Configuration(_) => "configuration",
            CaptureError::UpstreamOpen { .. } => "upstream_open",
            CaptureError::UpstreamRuntime { .. } => "upstream_runtime",
            CaptureError::FileOpen { .. } => "file_open",
            CaptureError::FileWrite { .. } => "file_write",
            CaptureError::RestartBudgetExhausted { .. } => "restart_budget",
            CaptureError::WriterInconsistent { .. } => "writer_inconsistent",
            CaptureError::Spawn(_) => "spawn",
        }
    }
}
