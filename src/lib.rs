//! # log2bin
//!
//! Supervised capture of a serial byte stream to a binary file. Bytes arrive
//! through callbacks on a thread owned by the ingestion source, pass through a
//! bounded queue, and are persisted by a writer thread that a supervisor
//! restarts if it crashes or hangs.
//!
//! ```text
//! source ──on_data──▶ IngestionBridge ──push──▶ BoundedQueue ──pop──▶ writer ──▶ file
//!                                                                     │
//!                          Supervisor ◀── LivenessRegister ◀──────────┘
//! ```
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered configuration (defaults, TOML, `LOG2BIN_*` env, CLI) via `figment`.
//! - **`error`**: The `CaptureError` taxonomy.
//! - **`liveness`**: Shared writer status record read by the supervisor.
//! - **`output`**: Output file opener seam.
//! - **`policy`**: Open-retry and restart policies.
//! - **`queue`**: Chunks, stop requests, and the bounded drop-newest queue.
//! - **`session`**: One capture run and its shutdown coordinator.
//! - **`source`**: Ingestion source trait, the bridge, and the mock/serial sources.
//! - **`supervisor`**: Crash and hang detection with bounded restarts.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.
//! - **`writer`**: The writer worker state machine.

pub mod config;
pub mod error;
pub mod liveness;
pub mod output;
pub mod policy;
pub mod queue;
pub mod session;
pub mod source;
pub mod supervisor;
pub mod tracing_setup;
pub mod writer;

pub use config::CaptureConfig;
pub use error::{AppResult, CaptureError};
pub use session::{CaptureSession, ShutdownReason, ShutdownReport, ShutdownTrigger};
