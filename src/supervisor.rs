//! Writer supervision.
//!
//! [`Supervisor::check`] is called on every poll tick. It inspects the
//! writer thread and the liveness register and reacts to three conditions:
//!
//! | Condition                                   | Reaction                                   |
//! |---------------------------------------------|--------------------------------------------|
//! | thread gone, register says running          | mark not running; restart if data pending, |
//! |                                             | otherwise fatal                            |
//! | thread alive, heartbeat stale               | stop that generation, bounded join,        |
//! |                                             | then restart                               |
//! | thread gone, queue non-empty                | restart                                    |
//!
//! A writer that ends in `Failed` has already used up its own retries and
//! is always fatal. Heartbeat staleness is only evaluated every
//! `status_check_interval`, which is also when the status line is logged.
//!
//! Replacements are bounded by [`RestartPolicy`]. A replacement is never
//! started while the previous writer thread may still touch the file.

use crate::error::{AppResult, CaptureError};
use crate::liveness::LivenessSnapshot;
use crate::policy::RestartPolicy;
use crate::queue::StopTarget;
use crate::writer::{spawn_writer, JoinOutcome, WorkerExit, WriterContext, WriterHandle};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Why a replacement writer is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// The writer thread panicked or failed.
    Crashed,
    /// The writer stopped heartbeating and was asked to stop.
    Hung,
    /// The writer exited cleanly while chunks were still queued.
    PendingData,
}

impl fmt::Display for RestartCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartCause::Crashed => "crashed",
            RestartCause::Hung => "hung",
            RestartCause::PendingData => "pending data",
        })
    }
}

/// Outcome of one supervision pass.
#[derive(Debug)]
pub enum Verdict {
    /// Nothing to do.
    Healthy,
    /// A replacement writer was spawned.
    Restarted {
        /// Generation of the new writer.
        generation: u64,
    },
    /// A restart is needed but must wait for backoff or a slow writer.
    Deferred,
    /// The session cannot continue.
    Fatal(CaptureError),
}

/// Owns the current writer and replaces it when it crashes or hangs.
///
/// Driven by the session loop through [`Supervisor::check`]; never spawns a
/// thread of its own.
pub struct Supervisor {
    ctx: WriterContext,
    policy: RestartPolicy,
    worker: Option<WriterHandle>,
    stop_requested: bool,
    awaiting_restart: Option<RestartCause>,
    restarts: u32,
    next_generation: u64,
    last_restart: Option<Instant>,
    last_status_check: Instant,
}

impl Supervisor {
    /// Spawn the first writer (generation 0) and start supervising it.
    pub fn start(ctx: WriterContext) -> AppResult<Self> {
        let policy = RestartPolicy::from_pipeline(&ctx.pipeline);
        let worker = spawn_writer(&ctx, 0)?;
        Ok(Self {
            ctx,
            policy,
            worker: Some(worker),
            stop_requested: false,
            awaiting_restart: None,
            restarts: 0,
            next_generation: 1,
            last_restart: None,
            last_status_check: Instant::now(),
        })
    }

    /// Replacement writers spawned so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Generation of the writer currently owned, if any.
    pub fn generation(&self) -> Option<u64> {
        self.worker.as_ref().map(WriterHandle::generation)
    }

    /// Hand the current writer to the shutdown path.
    pub fn take_worker(&mut self) -> Option<WriterHandle> {
        self.awaiting_restart = None;
        self.worker.take()
    }

    /// One supervision pass: reap a finished writer, retry a deferred
    /// restart, or check the heartbeat once per status interval.
    pub fn check(&mut self) -> Verdict {
        if let Some(cause) = self.awaiting_restart {
            return self.restart(cause);
        }
        let finished = match &self.worker {
            Some(worker) => worker.is_finished(),
            None => return Verdict::Healthy,
        };
        if finished {
            return self.reap();
        }

        if self.last_status_check.elapsed() >= self.ctx.pipeline.status_check_interval {
            self.last_status_check = Instant::now();
            let snapshot = self.ctx.register.snapshot();
            self.report_status(&snapshot);
            let timeout = self.ctx.pipeline.heartbeat_timeout;
            if snapshot.running && !self.ctx.register.is_alive(timeout) {
                return self.unstick(snapshot.last_heartbeat.elapsed());
            }
        }
        Verdict::Healthy
    }

    fn report_status(&self, snapshot: &LivenessSnapshot) {
        info!(
            generation = snapshot.generation,
            running = snapshot.running,
            megabytes = snapshot.megabytes_written(),
            queued = self.ctx.queue.len(),
            dropped_chunks = self.ctx.queue.dropped_chunks(),
            restarts = self.restarts,
            "capture status"
        );
    }

    /// Ask a hung writer to stop and give it a bounded time to do so.
    fn unstick(&mut self, stale_for: Duration) -> Verdict {
        let Some(worker) = self.worker.as_ref() else {
            return Verdict::Healthy;
        };
        let generation = worker.generation();
        let wait = self.ctx.pipeline.hang_join_timeout;
        warn!(
            generation,
            stale_ms = stale_for.as_millis() as u64,
            "writer heartbeat stale, requesting stop"
        );

        if !self
            .ctx
            .queue
            .push_shutdown(StopTarget::Generation(generation), wait)
        {
            warn!(generation, "queue full, stop request not delivered");
        }
        self.stop_requested = true;

        if worker.wait(wait) {
            self.reap()
        } else {
            warn!(
                generation,
                wait_ms = wait.as_millis() as u64,
                "hung writer did not exit, replacement deferred"
            );
            Verdict::Deferred
        }
    }

    /// Collect a finished writer and decide what replaces it.
    fn reap(&mut self) -> Verdict {
        let Some(mut worker) = self.worker.take() else {
            return Verdict::Healthy;
        };
        let generation = worker.generation();
        let stop_requested = std::mem::take(&mut self.stop_requested);
        let pending = !self.ctx.queue.is_empty();

        match worker.join_timeout(Duration::ZERO) {
            JoinOutcome::StillRunning => {
                self.worker = Some(worker);
                self.stop_requested = stop_requested;
                Verdict::Healthy
            }
            JoinOutcome::Exited(WorkerExit::Failed { error, .. }) => {
                error!(generation, error = %error, kind = error.kind(), "writer failed");
                Verdict::Fatal(error)
            }
            JoinOutcome::Exited(WorkerExit::Stopped { bytes_written }) => {
                info!(generation, bytes_written, stop_requested, "writer exited");
                if stop_requested {
                    self.restart(RestartCause::Hung)
                } else if pending {
                    self.restart(RestartCause::PendingData)
                } else {
                    Verdict::Fatal(CaptureError::WriterInconsistent {
                        last_error: "writer stopped without a stop request".into(),
                    })
                }
            }
            JoinOutcome::Panicked(message) => {
                let snapshot = self.ctx.register.snapshot();
                if snapshot.running {
                    error!(
                        generation,
                        message,
                        "writer thread exited while marked running"
                    );
                    self.ctx
                        .register
                        .mark_not_running(format!("writer panicked: {message}"));
                }
                if pending || stop_requested {
                    self.restart(RestartCause::Crashed)
                } else {
                    Verdict::Fatal(CaptureError::WriterInconsistent {
                        last_error: snapshot.last_error.unwrap_or(message),
                    })
                }
            }
        }
    }

    /// Start one last writer to drain chunks left behind by a writer that is
    /// gone, typically while a restart waits out its backoff. Skips the
    /// backoff but still counts against the restart budget.
    pub fn start_drain_writer(&mut self) -> AppResult<WriterHandle> {
        self.awaiting_restart = None;
        if !self.policy.allows(self.restarts) {
            return Err(CaptureError::RestartBudgetExhausted {
                restarts: self.restarts,
            });
        }
        let generation = self.next_generation;
        let handle = spawn_writer(&self.ctx, generation)?;
        self.next_generation += 1;
        self.restarts += 1;
        self.last_restart = Some(Instant::now());
        warn!(
            generation,
            restarts = self.restarts,
            queued = self.ctx.queue.len(),
            "starting drain writer for queued chunks"
        );
        Ok(handle)
    }

    fn restart(&mut self, cause: RestartCause) -> Verdict {
        if !self.policy.allows(self.restarts) {
            self.awaiting_restart = None;
            error!(
                restarts = self.restarts,
                max_restarts = self.policy.max_restarts,
                %cause,
                "restart budget exhausted"
            );
            return Verdict::Fatal(CaptureError::RestartBudgetExhausted {
                restarts: self.restarts,
            });
        }

        if let Some(last) = self.last_restart {
            let delay = self.policy.delay_for(self.restarts.saturating_sub(1));
            let elapsed = last.elapsed();
            if elapsed < delay {
                self.awaiting_restart = Some(cause);
                info!(
                    %cause,
                    remaining_ms = (delay - elapsed).as_millis() as u64,
                    "restart deferred by backoff"
                );
                return Verdict::Deferred;
            }
        }

        self.awaiting_restart = None;
        let generation = self.next_generation;
        match spawn_writer(&self.ctx, generation) {
            Ok(handle) => {
                self.worker = Some(handle);
                self.next_generation += 1;
                self.restarts += 1;
                self.last_restart = Some(Instant::now());
                warn!(
                    generation,
                    restarts = self.restarts,
                    %cause,
                    path = %self.ctx.path.display(),
                    "writer restarted"
                );
                Verdict::Restarted { generation }
            }
            Err(e) => {
                error!(generation, error = %e, "failed to start replacement writer");
                Verdict::Fatal(e)
            }
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("generation", &self.generation())
            .field("restarts", &self.restarts)
            .field("awaiting_restart", &self.awaiting_restart)
            .finish()
    }
}
