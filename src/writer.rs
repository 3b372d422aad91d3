//! Writer worker: drains the queue into the capture file.
//!
//! Each worker runs on its own named thread and walks this state machine:
//!
//! ```text
//! Starting ──open ok──▶ Running ──stop request──▶ Draining ──▶ Stopped
//!    │                    │  ▲
//!    │ retries exhausted  │  └── write error, reopen (append) ok
//!    ▼                    ▼
//!  Failed ◀──── reopen failed
//! ```
//!
//! While running the worker refreshes its heartbeat every
//! `heartbeat_interval` whether or not data arrives, flushes to stable
//! storage every `flush_interval`, and waits at most `pop_timeout` for the
//! next chunk. The output file is released on every exit path: explicitly
//! on `Stopped`/`Failed`, and by `Drop` if the thread unwinds.
//!
//! Stop requests carry a [`StopTarget`]. A worker ignores requests addressed
//! to another generation, so a sentinel aimed at a hung predecessor cannot
//! stop its replacement.

use crate::config::PipelineConfig;
use crate::error::{AppResult, CaptureError};
use crate::liveness::LivenessRegister;
use crate::output::{OpenMode, OutputFile, OutputOpener};
use crate::policy::RetryPolicy;
use crate::queue::{BoundedQueue, Chunk, Pop, QueueItem, StopTarget};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MEGABYTE: u64 = 1024 * 1024;

/// Writer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Opening the output file.
    Starting,
    /// Consuming the queue.
    Running,
    /// Stop requested; writing what is still queued.
    Draining,
    /// Closed cleanly.
    Stopped,
    /// Gave up; see [`WorkerExit::Failed`].
    Failed,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriterState::Starting => "starting",
            WriterState::Running => "running",
            WriterState::Draining => "draining",
            WriterState::Stopped => "stopped",
            WriterState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a writer thread ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// Drained after a stop request and closed the file cleanly.
    Stopped {
        /// Bytes in the file when it was closed.
        bytes_written: u64,
    },
    /// Gave up after exhausting open retries, or after a write or final
    /// flush that one append-mode reopen could not recover.
    Failed {
        /// Bytes confirmed on disk at the time of the failure.
        bytes_written: u64,
        /// What went wrong.
        error: CaptureError,
    },
}

impl WorkerExit {
    /// Byte count carried by either variant.
    pub fn bytes_written(&self) -> u64 {
        match self {
            WorkerExit::Stopped { bytes_written } | WorkerExit::Failed { bytes_written, .. } => {
                *bytes_written
            }
        }
    }
}

/// Everything a writer needs, shared by every generation of a session.
#[derive(Clone)]
pub struct WriterContext {
    /// Source of chunks and stop requests.
    pub queue: Arc<BoundedQueue>,
    /// Heartbeat and status shared with the supervisor.
    pub register: Arc<LivenessRegister>,
    /// Creates or reopens the output file.
    pub opener: Arc<dyn OutputOpener>,
    /// Output file path.
    pub path: PathBuf,
    /// Timeouts, intervals and retry limits.
    pub pipeline: PipelineConfig,
}

/// Result of waiting for a writer thread.
#[derive(Debug)]
pub enum JoinOutcome {
    /// The thread returned normally.
    Exited(WorkerExit),
    /// The thread panicked; carries the panic message.
    Panicked(String),
    /// The wait expired first. The handle is still usable.
    StillRunning,
}

/// Owner's handle on a running writer thread.
pub struct WriterHandle {
    generation: u64,
    thread: Option<JoinHandle<WorkerExit>>,
    // Never sent on; disconnects when the writer thread ends, even by panic.
    done: Receiver<()>,
}

impl WriterHandle {
    /// Generation number this writer was spawned with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the thread has stopped executing (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to end without reaping it.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Wait up to `timeout` for the thread to end, then reap it.
    pub fn join_timeout(&mut self, timeout: Duration) -> JoinOutcome {
        if !self.wait(timeout) {
            return JoinOutcome::StillRunning;
        }
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(exit) => JoinOutcome::Exited(exit),
                Err(payload) => JoinOutcome::Panicked(panic_message(payload.as_ref())),
            },
            None => JoinOutcome::Panicked("writer thread already joined".to_string()),
        }
    }
}

impl fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterHandle")
            .field("generation", &self.generation)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "writer thread panicked".to_string()
    }
}

/// Start writer `generation` on a new thread.
///
/// Generation 0 truncates the output; later generations append to whatever
/// their predecessors left behind.
pub fn spawn_writer(ctx: &WriterContext, generation: u64) -> AppResult<WriterHandle> {
    let mode = if generation == 0 {
        OpenMode::Truncate
    } else {
        OpenMode::Append
    };
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
    let worker = WriterWorker::new(ctx.clone(), generation, mode);

    let thread = thread::Builder::new()
        .name(format!("capture-writer-{generation}"))
        .spawn(move || {
            let _done = DoneGuard(done_tx);
            worker.run()
        })
        .map_err(CaptureError::Spawn)?;

    Ok(WriterHandle {
        generation,
        thread: Some(thread),
        done: done_rx,
    })
}

struct DoneGuard(#[allow(dead_code)] Sender<()>);

struct WriterWorker {
    ctx: WriterContext,
    generation: u64,
    mode: OpenMode,
    state: WriterState,
    output: Option<Box<dyn OutputFile>>,
    written: u64,
}

impl WriterWorker {
    fn new(ctx: WriterContext, generation: u64, mode: OpenMode) -> Self {
        Self {
            ctx,
            generation,
            mode,
            state: WriterState::Starting,
            output: None,
            written: 0,
        }
    }

    fn run(mut self) -> WorkerExit {
        info!(
            generation = self.generation,
            path = %self.ctx.path.display(),
            mode = ?self.mode,
            "writer starting"
        );
        self.ctx.register.mark_started(self.generation, 0);

        let result = self
            .open_with_retry()
            .and_then(|()| self.run_loop())
            .and_then(|()| self.drain());
        let result = match result {
            Ok(()) => self.close(),
            Err(e) => {
                self.abandon_output();
                Err(e)
            }
        };

        match result {
            Ok(()) => {
                self.transition(WriterState::Stopped);
                self.ctx.register.mark_stopped(self.written, None);
                info!(
                    generation = self.generation,
                    bytes_written = self.written,
                    "writer stopped"
                );
                WorkerExit::Stopped {
                    bytes_written: self.written,
                }
            }
            Err(error) => {
                self.transition(WriterState::Failed);
                self.ctx
                    .register
                    .mark_stopped(self.written, Some(error.to_string()));
                error!(
                    generation = self.generation,
                    bytes_written = self.written,
                    error = %error,
                    "writer failed"
                );
                WorkerExit::Failed {
                    bytes_written: self.written,
                    error,
                }
            }
        }
    }

    fn transition(&mut self, next: WriterState) {
        info!(
            generation = self.generation,
            from = %self.state,
            to = %next,
            bytes_written = self.written,
            "writer state change"
        );
        self.state = next;
    }

    fn open_with_retry(&mut self) -> AppResult<()> {
        let policy = RetryPolicy::from_pipeline(&self.ctx.pipeline);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ctx.opener.open(&self.ctx.path, self.mode) {
                Ok(opened) => {
                    self.written = opened.existing_len;
                    self.output = Some(opened.file);
                    self.ctx.register.heartbeat(self.written);
                    if opened.existing_len > 0 {
                        info!(
                            generation = self.generation,
                            existing_bytes = opened.existing_len,
                            "appending to existing capture"
                        );
                    }
                    self.transition(WriterState::Running);
                    return Ok(());
                }
                Err(source) => {
                    let message = format!(
                        "failed to open output (attempt {attempt}/{}): {source}",
                        policy.max_attempts
                    );
                    warn!(
                        generation = self.generation,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %source,
                        "failed to open output file"
                    );
                    self.ctx.register.record_error(message);
                    if attempt >= policy.max_attempts {
                        return Err(CaptureError::FileOpen {
                            path: self.ctx.path.clone(),
                            attempts: attempt,
                            source,
                        });
                    }
                    thread::sleep(policy.backoff_delay);
                }
            }
        }
    }

    /// `Running` until a stop request for this generation arrives.
    fn run_loop(&mut self) -> AppResult<()> {
        let heartbeat_interval = self.ctx.pipeline.heartbeat_interval;
        let flush_interval = self.ctx.pipeline.flush_interval;
        let pop_timeout = self.ctx.pipeline.pop_timeout;
        let mut last_heartbeat = Instant::now();
        let mut last_flush = Instant::now();

        loop {
            let now = Instant::now();
            if now.duration_since(last_heartbeat) >= heartbeat_interval {
                self.ctx.register.heartbeat(self.written);
                last_heartbeat = now;
            }
            if now.duration_since(last_flush) >= flush_interval {
                if let Err(e) = self.flush() {
                    warn!(generation = self.generation, error = %e, "periodic flush failed");
                    self.ctx
                        .register
                        .record_error(format!("periodic flush failed: {e}"));
                }
                last_flush = now;
            }

            match self.ctx.queue.pop_bounded(pop_timeout) {
                Pop::TimedOut => {}
                Pop::Data(chunk) => self.write_chunk(&chunk)?,
                Pop::Shutdown(target) if target.applies_to(self.generation) => {
                    info!(generation = self.generation, ?target, "stop request received");
                    self.transition(WriterState::Draining);
                    return Ok(());
                }
                Pop::Shutdown(target) => {
                    debug!(
                        generation = self.generation,
                        ?target,
                        "ignoring stop request for another writer"
                    );
                }
            }
        }
    }

    /// Write whatever was already queued when draining began.
    fn drain(&mut self) -> AppResult<()> {
        let pending = self.ctx.queue.len();
        let mut drained = 0usize;
        for _ in 0..pending {
            match self.ctx.queue.try_pop() {
                Some(QueueItem::Data(chunk)) => {
                    self.write_chunk(&chunk)?;
                    drained += 1;
                }
                Some(QueueItem::Shutdown(_)) => {}
                None => break,
            }
        }
        debug!(generation = self.generation, drained, "queue drained");
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> AppResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let result = match self.output.as_mut() {
            Some(output) => output.write_all(chunk.as_bytes()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "output not open")),
        };
        match result {
            Ok(()) => {
                let before = self.written;
                self.written += chunk.len() as u64;
                if before / MEGABYTE != self.written / MEGABYTE {
                    self.ctx.register.heartbeat(self.written);
                    info!(
                        generation = self.generation,
                        megabytes = self.written as f64 / MEGABYTE as f64,
                        "capture progress"
                    );
                }
                Ok(())
            }
            Err(e) => self.recover_from_write_error(e, chunk.len()),
        }
    }

    /// One recovery attempt: reopen in append mode, replay whatever the
    /// broken handle still buffered, carry on.
    ///
    /// The chunk whose write failed is not retried. `written` is reconciled
    /// with what actually reached the file.
    fn recover_from_write_error(&mut self, error: io::Error, dropped: usize) -> AppResult<()> {
        error!(
            generation = self.generation,
            error = %error,
            dropped_bytes = dropped,
            "write failed, reopening output in append mode"
        );
        self.ctx
            .register
            .record_error(format!("write failed: {error}"));

        let counted = self.written;
        let salvaged = self.release_broken_output();
        self.reopen_and_replay(&salvaged)?;
        let lost = counted.saturating_sub(self.written) + dropped as u64;
        warn!(
            generation = self.generation,
            bytes_written = self.written,
            replayed_bytes = salvaged.len(),
            lost_bytes = lost,
            "output reopened, continuing"
        );
        Ok(())
    }

    /// Take the current handle out of service, keeping its unflushed bytes.
    fn release_broken_output(&mut self) -> Vec<u8> {
        let Some(mut broken) = self.output.take() else {
            return Vec::new();
        };
        if let Err(e) = broken.flush() {
            debug!(generation = self.generation, error = %e, "flush of failed handle");
        }
        broken.into_unflushed()
    }

    fn reopen_and_replay(&mut self, salvaged: &[u8]) -> AppResult<()> {
        let write_error = |source: io::Error| CaptureError::FileWrite {
            path: self.ctx.path.clone(),
            source,
        };
        let opened = match self.ctx.opener.open(&self.ctx.path, OpenMode::Append) {
            Ok(opened) => opened,
            Err(source) => {
                self.ctx
                    .register
                    .record_error(format!("reopen failed: {source}"));
                return Err(write_error(source));
            }
        };
        let mut file = opened.file;
        if !salvaged.is_empty() {
            file.write_all(salvaged).map_err(write_error)?;
        }
        self.written = opened.existing_len + salvaged.len() as u64;
        self.output = Some(file);
        self.ctx.register.heartbeat(self.written);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.output.as_mut() {
            Some(output) => output.sync(),
            None => Ok(()),
        }
    }

    /// Final flush and release. A failed flush gets the same single
    /// append-mode reopen as a failed write; if that cannot be synced either,
    /// the capture is incomplete and the writer fails.
    fn close(&mut self) -> AppResult<()> {
        let error = match self.flush() {
            Ok(()) => {
                self.output = None;
                return Ok(());
            }
            Err(e) => e,
        };
        warn!(
            generation = self.generation,
            error = %error,
            "final flush failed, reopening output in append mode"
        );
        self.ctx
            .register
            .record_error(format!("final flush failed: {error}"));

        let salvaged = self.release_broken_output();
        self.reopen_and_replay(&salvaged)?;
        let synced = self.flush();
        self.abandon_output();
        synced.map_err(|source| {
            self.ctx
                .register
                .record_error(format!("final flush failed after reopen: {source}"));
            CaptureError::FileWrite {
                path: self.ctx.path.clone(),
                source,
            }
        })
    }

    /// Best-effort release on the failure path.
    fn abandon_output(&mut self) {
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.sync() {
                debug!(generation = self.generation, error = %e, "flush on abandon failed");
            }
        }
    }
}
