//! Upstream ingestion sources and the bridge that feeds the queue.
//!
//! An [`IngestionSource`] owns the physical (or simulated) interface and
//! calls back into a [`SourceCallbacks`] implementation from a thread it
//! controls, for as long as it is open. The pipeline's implementation is
//! [`IngestionBridge`]: it copies each delivery into a [`Chunk`], pushes it
//! without waiting, and turns every upstream error into a fatal shutdown
//! request.
//!
//! Two sources ship with the crate:
//! - [`mock::MockSource`]: test double and `--simulate` generator.
//! - `serial::SerialSource` (feature `serial`): a `serialport` reader thread.

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

use crate::error::CaptureError;
use crate::queue::{BoundedQueue, Chunk, PushOutcome};
use crate::session::ShutdownReason;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Integer status returned by source operations. `0` means success.
pub type StatusCode = i32;

/// Status codes used by the bundled sources.
pub mod status {
    use super::StatusCode;

    /// Success.
    pub const OK: StatusCode = 0;
    /// `open` called on a source that is already open.
    pub const ALREADY_OPEN: StatusCode = -1;
    /// Operation needs an open source.
    pub const NOT_OPEN: StatusCode = -2;
    /// The named port does not exist.
    pub const NO_DEVICE: StatusCode = -3;
    /// Bad port name or settings.
    pub const INVALID_INPUT: StatusCode = -4;
    /// Read or write fault on the device.
    pub const IO: StatusCode = -5;
    /// Anything else.
    pub const UNKNOWN: StatusCode = -99;
}

/// Receiver of upstream deliveries.
///
/// Both methods are invoked synchronously on the source's thread and must
/// return promptly.
pub trait SourceCallbacks: Send + Sync {
    /// `data` is only valid for the duration of the call.
    fn on_data(&self, data: &[u8]);
    /// Upstream fault; the source may keep running or stop after this.
    fn on_error(&self, code: StatusCode, message: &str);
}

/// External byte source driving a [`SourceCallbacks`] implementation.
pub trait IngestionSource: Send {
    /// Start delivering to `callbacks`. Deliveries may begin before this returns.
    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
        callbacks: Arc<dyn SourceCallbacks>,
    ) -> Result<(), StatusCode>;

    /// Stop delivering. No callback is in flight or started once this returns.
    fn close(&mut self) -> Result<(), StatusCode>;

    /// Whether the source is currently delivering.
    fn is_open(&self) -> bool;

    /// Send bytes to the device. Capture never calls this.
    fn write(&mut self, data: &[u8]) -> Result<(), StatusCode>;
}

/// Counters kept by the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Deliveries pushed onto the queue.
    pub accepted_chunks: u64,
    /// Bytes in accepted deliveries.
    pub accepted_bytes: u64,
    /// Deliveries discarded because the queue was full.
    pub dropped_chunks: u64,
    /// Bytes in dropped deliveries.
    pub dropped_bytes: u64,
    /// Error callbacks received.
    pub upstream_errors: u64,
}

/// Adapts source callbacks onto the bounded queue.
pub struct IngestionBridge {
    queue: Arc<BoundedQueue>,
    shutdown: Sender<ShutdownReason>,
    accepted_chunks: AtomicU64,
    accepted_bytes: AtomicU64,
    dropped_chunks: AtomicU64,
    dropped_bytes: AtomicU64,
    upstream_errors: AtomicU64,
}

impl IngestionBridge {
    /// Bridge pushing into `queue` and reporting upstream errors on `shutdown`.
    pub fn new(queue: Arc<BoundedQueue>, shutdown: Sender<ShutdownReason>) -> Self {
        Self {
            queue,
            shutdown,
            accepted_chunks: AtomicU64::new(0),
            accepted_bytes: AtomicU64::new(0),
            dropped_chunks: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            accepted_chunks: self.accepted_chunks.load(Ordering::Relaxed),
            accepted_bytes: self.accepted_bytes.load(Ordering::Relaxed),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

impl SourceCallbacks for IngestionBridge {
    fn on_data(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let len = data.len() as u64;
        match self.queue.push_nonblocking(Chunk::copy_from_slice(data)) {
            PushOutcome::Accepted => {
                self.accepted_chunks.fetch_add(1, Ordering::Relaxed);
                self.accepted_bytes.fetch_add(len, Ordering::Relaxed);
            }
            PushOutcome::Dropped => {
                let dropped = self.dropped_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                self.dropped_bytes.fetch_add(len, Ordering::Relaxed);
                warn!(
                    len,
                    dropped_chunks = dropped,
                    capacity = self.queue.capacity(),
                    "queue full, dropping chunk"
                );
            }
        }
    }

    fn on_error(&self, code: StatusCode, message: &str) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
        error!(code, message, "ingestion source reported an error");
        let reason = ShutdownReason::Fatal(CaptureError::UpstreamRuntime {
            code,
            message: message.to_string(),
        });
        // Unbounded channel: never blocks the source thread. A closed
        // receiver means shutdown is already under way.
        let _ = self.shutdown.try_send(reason);
    }
}
