//! Capture session and shutdown coordination.
//!
//! A [`CaptureSession`] owns everything one capture run needs: the queue,
//! the liveness register, the output opener and the ingestion source. Nothing
//! is process-global, so several sessions can run side by side in tests.
//!
//! ## Lifecycle
//!
//! 1. [`CaptureSession::run`] starts writer generation 0 under a
//!    [`Supervisor`], then opens the source with an [`IngestionBridge`] as
//!    its callbacks.
//! 2. The control loop waits on a `crossbeam_channel::select!` over the
//!    supervisor tick and the shutdown channel. Each tick checks the source
//!    and runs one supervision pass.
//! 3. The first [`ShutdownReason`] (interrupt, fatal error, or source closed)
//!    hands control to the shutdown coordinator:
//!    - close the source so no further chunks arrive
//!    - enqueue a stop request addressed to every writer
//!    - join the writer for `shutdown_join_timeout`, re-send if needed, and
//!      join again for `shutdown_retry_join_timeout`
//!    - if it is still running, warn and return without touching the thread
//!
//! The writer is never forcibly terminated; a thread killed mid-write could
//! corrupt the file or leak the handle.

use crate::config::{CaptureConfig, PipelineConfig};
use crate::error::{AppResult, CaptureError};
use crate::liveness::LivenessRegister;
use crate::output::{FsOpener, OutputOpener};
use crate::queue::{BoundedQueue, StopTarget};
use crate::source::{BridgeStats, IngestionBridge, IngestionSource, SourceCallbacks};
use crate::supervisor::{Supervisor, Verdict};
use crate::writer::{JoinOutcome, WorkerExit, WriterContext, WriterHandle};
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Why a session ended.
#[derive(Debug)]
pub enum ShutdownReason {
    /// External interrupt (Ctrl+C).
    Interrupt,
    /// The ingestion source stopped on its own.
    SourceClosed,
    /// Unrecoverable failure in the source, writer or supervisor.
    Fatal(CaptureError),
}

impl ShutdownReason {
    /// True for [`ShutdownReason::Fatal`].
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::SourceClosed => f.write_str("source closed"),
            ShutdownReason::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// Cloneable handle for requesting shutdown from outside the control loop.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    tx: Sender<ShutdownReason>,
}

impl ShutdownTrigger {
    /// Request shutdown as if Ctrl+C had been pressed.
    pub fn interrupt(&self) {
        self.request(ShutdownReason::Interrupt);
    }

    /// Request shutdown. Only the first request received is acted on.
    pub fn request(&self, reason: ShutdownReason) {
        if self.tx.try_send(reason).is_err() {
            warn!("shutdown already completed, request ignored");
        }
    }
}

/// Summary produced once the session has shut down.
#[derive(Debug)]
pub struct ShutdownReport {
    /// First shutdown cause, or a fatal error raised while stopping.
    pub reason: ShutdownReason,
    /// File the session wrote to.
    pub output_path: PathBuf,
    /// Bytes confirmed written by the last writer.
    pub bytes_written: u64,
    /// Callback counters from the ingestion bridge.
    pub bridge: BridgeStats,
    /// Replacement writers spawned, including a final drain writer.
    pub restarts: u32,
    /// Whether the last writer exited within the shutdown joins.
    pub writer_terminated: bool,
    /// Most recent writer error message, if any.
    pub last_error: Option<String>,
}

impl ShutdownReport {
    /// `0` for a clean, fully drained stop; `1` otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.reason.is_fatal() || !self.writer_terminated {
            1
        } else {
            0
        }
    }

    /// `bytes_written` in MiB.
    pub fn megabytes_written(&self) -> f64 {
        self.bytes_written as f64 / (1024.0 * 1024.0)
    }
}

/// One capture run.
pub struct CaptureSession {
    port: String,
    baud_rate: u32,
    pipeline: PipelineConfig,
    path: PathBuf,
    queue: Arc<BoundedQueue>,
    register: Arc<LivenessRegister>,
    opener: Arc<dyn OutputOpener>,
    source: Box<dyn IngestionSource>,
    bridge: Arc<IngestionBridge>,
    shutdown_tx: Sender<ShutdownReason>,
    shutdown_rx: Receiver<ShutdownReason>,
}

impl CaptureSession {
    /// Build a session writing to `path` with the filesystem opener.
    pub fn new(config: &CaptureConfig, path: PathBuf, source: Box<dyn IngestionSource>) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.pipeline.queue_capacity));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::unbounded();
        let bridge = Arc::new(IngestionBridge::new(
            Arc::clone(&queue),
            shutdown_tx.clone(),
        ));
        Self {
            port: config.source.port.clone(),
            baud_rate: config.source.baud_rate,
            pipeline: config.pipeline.clone(),
            path,
            queue,
            register: Arc::new(LivenessRegister::new()),
            opener: Arc::new(FsOpener),
            source,
            bridge,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replace the output opener.
    pub fn with_opener(mut self, opener: Arc<dyn OutputOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Handle for stopping the session from another thread.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Queue between the bridge and the writer.
    pub fn queue(&self) -> &Arc<BoundedQueue> {
        &self.queue
    }

    /// Liveness register shared with every writer generation.
    pub fn register(&self) -> &Arc<LivenessRegister> {
        &self.register
    }

    /// File the session writes to.
    pub fn output_path(&self) -> &Path {
        &self.path
    }

    /// Capture until interrupted, the source closes, or a fatal error.
    ///
    /// Returns `Err` only when the first writer cannot be started; every
    /// later failure is reported through [`ShutdownReport::reason`].
    pub fn run(mut self) -> AppResult<ShutdownReport> {
        let ctx = WriterContext {
            queue: Arc::clone(&self.queue),
            register: Arc::clone(&self.register),
            opener: Arc::clone(&self.opener),
            path: self.path.clone(),
            pipeline: self.pipeline.clone(),
        };
        let mut supervisor = Supervisor::start(ctx)?;
        info!(path = %self.path.display(), "capture started");

        let callbacks: Arc<dyn SourceCallbacks> = self.bridge.clone();
        let reason = match self.source.open(&self.port, self.baud_rate, callbacks) {
            Ok(()) => {
                info!(port = %self.port, baud_rate = self.baud_rate, "ingestion source open");
                self.control_loop(&mut supervisor)
            }
            Err(code) => {
                error!(port = %self.port, code, "failed to open ingestion source");
                ShutdownReason::Fatal(CaptureError::UpstreamOpen {
                    port: self.port.clone(),
                    code,
                })
            }
        };

        Ok(self.shutdown(supervisor, reason))
    }

    fn control_loop(&mut self, supervisor: &mut Supervisor) -> ShutdownReason {
        let ticker = crossbeam_channel::tick(self.pipeline.supervisor_poll_interval);
        loop {
            crossbeam_channel::select! {
                recv(self.shutdown_rx) -> request => {
                    // The session holds a sender, so the channel cannot disconnect.
                    return request.unwrap_or(ShutdownReason::Interrupt);
                }
                recv(ticker) -> _ => {
                    if !self.source.is_open() {
                        // A source that died on a fault has already asked for a fatal stop.
                        return self
                            .shutdown_rx
                            .try_recv()
                            .unwrap_or(ShutdownReason::SourceClosed);
                    }
                    match supervisor.check() {
                        Verdict::Healthy => {}
                        Verdict::Restarted { generation } => {
                            info!(generation, "capture continuing with replacement writer");
                        }
                        Verdict::Deferred => {}
                        Verdict::Fatal(e) => return ShutdownReason::Fatal(e),
                    }
                }
            }
        }
    }

    /// Close the source, stop the writer, and summarize.
    fn shutdown(mut self, mut supervisor: Supervisor, mut reason: ShutdownReason) -> ShutdownReport {
        info!(%reason, "shutting down");

        if let Err(code) = self.source.close() {
            warn!(code, "ingestion source reported an error on close");
        }

        let mut writer_terminated = true;
        if let Some(worker) = supervisor.take_worker() {
            writer_terminated = self.finish_writer(worker, &mut reason);
        }
        if writer_terminated && !self.queue.is_empty() {
            // The last writer died (or was never replaced) with chunks still queued.
            match supervisor.start_drain_writer() {
                Ok(worker) => writer_terminated = self.finish_writer(worker, &mut reason),
                Err(e) => {
                    error!(
                        queued = self.queue.len(),
                        error = %e,
                        "no writer available, queued chunks were not written"
                    );
                    if !reason.is_fatal() {
                        reason = ShutdownReason::Fatal(e);
                    }
                }
            }
        }

        let snapshot = self.register.snapshot();
        let report = ShutdownReport {
            reason,
            output_path: self.path.clone(),
            bytes_written: snapshot.bytes_written,
            bridge: self.bridge.stats(),
            restarts: supervisor.restarts(),
            writer_terminated,
            last_error: snapshot.last_error,
        };
        info!(
            path = %report.output_path.display(),
            megabytes = report.megabytes_written(),
            bytes_written = report.bytes_written,
            dropped_chunks = report.bridge.dropped_chunks,
            restarts = report.restarts,
            writer_terminated,
            "capture finished"
        );
        report
    }

    /// Stop `worker` and fold its outcome into `reason`. Returns whether the
    /// thread ended within the shutdown joins.
    fn finish_writer(&self, worker: WriterHandle, reason: &mut ShutdownReason) -> bool {
        match self.stop_writer(worker) {
            Some(JoinOutcome::Exited(WorkerExit::Stopped { bytes_written })) => {
                info!(bytes_written, "writer drained and closed");
            }
            Some(JoinOutcome::Exited(WorkerExit::Failed { error, .. })) => {
                error!(error = %error, "writer failed while draining");
                if !reason.is_fatal() {
                    *reason = ShutdownReason::Fatal(error);
                }
            }
            Some(JoinOutcome::Panicked(message)) => {
                error!(message, "writer panicked while draining");
                if !reason.is_fatal() {
                    *reason = ShutdownReason::Fatal(CaptureError::WriterInconsistent {
                        last_error: message,
                    });
                }
            }
            Some(JoinOutcome::StillRunning) | None => return false,
        }
        true
    }

    /// Stop request plus escalating bounded joins. `None` means the writer
    /// was still running after both joins.
    fn stop_writer(&self, mut worker: WriterHandle) -> Option<JoinOutcome> {
        let first = self.pipeline.shutdown_join_timeout;
        let retry = self.pipeline.shutdown_retry_join_timeout;
        let generation = worker.generation();

        let delivered = self.queue.push_shutdown(StopTarget::All, first);
        if !delivered {
            warn!(generation, "queue full, stop request not yet delivered");
        }
        match worker.join_timeout(first) {
            JoinOutcome::StillRunning => {}
            outcome => return Some(outcome),
        }

        warn!(
            generation,
            waited_ms = first.as_millis() as u64,
            "writer still running, waiting again"
        );
        if !delivered && !self.queue.push_shutdown(StopTarget::All, retry) {
            warn!(generation, "queue full, stop request not delivered");
        }
        match worker.join_timeout(retry) {
            JoinOutcome::StillRunning => {
                warn!(
                    generation,
                    queued = self.queue.len(),
                    "writer did not terminate, exiting without forcing it"
                );
                None
            }
            outcome => Some(outcome),
        }
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate)
            .field("path", &self.path)
            .field("queue", &self.queue)
            .finish()
    }
}
