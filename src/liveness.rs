//! Shared writer status record.
//!
//! The active writer publishes its state here; the supervisor reads it to
//! decide whether the writer is healthy. All fields live behind one mutex so a
//! reader never observes, say, a fresh heartbeat paired with a stale byte
//! count.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Point-in-time copy of the register.
#[derive(Debug, Clone)]
pub struct LivenessSnapshot {
    /// Whether a writer claims to be running.
    pub running: bool,
    /// Most recent error reported by any writer of this session.
    pub last_error: Option<String>,
    /// Bytes accepted by the current writer, including any bytes already in
    /// the file it appended to.
    pub bytes_written: u64,
    /// Last time the writer proved it was alive.
    pub last_heartbeat: Instant,
    /// Generation of the writer that last started.
    pub generation: u64,
}

impl LivenessSnapshot {
    /// Megabytes written, for status lines.
    pub fn megabytes_written(&self) -> f64 {
        self.bytes_written as f64 / (1024.0 * 1024.0)
    }
}

/// Mutex-protected liveness record shared by writer and supervisor.
#[derive(Debug)]
pub struct LivenessRegister {
    state: Mutex<LivenessSnapshot>,
}

impl Default for LivenessRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessRegister {
    /// Register with no writer running.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LivenessSnapshot {
                running: false,
                last_error: None,
                bytes_written: 0,
                last_heartbeat: Instant::now(),
                generation: 0,
            }),
        }
    }

    /// A writer of `generation` is starting with `bytes_written` already on disk.
    pub fn mark_started(&self, generation: u64, bytes_written: u64) {
        let mut state = self.state.lock();
        state.running = true;
        state.generation = generation;
        state.bytes_written = bytes_written;
        state.last_heartbeat = Instant::now();
    }

    /// Refresh the heartbeat and publish the current byte count.
    pub fn heartbeat(&self, bytes_written: u64) {
        let mut state = self.state.lock();
        state.bytes_written = bytes_written;
        state.last_heartbeat = Instant::now();
    }

    /// Record a (possibly recovered) error. Also counts as a heartbeat.
    pub fn record_error(&self, error: impl Into<String>) {
        let mut state = self.state.lock();
        state.last_error = Some(error.into());
        state.last_heartbeat = Instant::now();
    }

    /// Terminal update from a writer that has released its file.
    pub fn mark_stopped(&self, bytes_written: u64, error: Option<String>) {
        let mut state = self.state.lock();
        state.running = false;
        state.bytes_written = bytes_written;
        if error.is_some() {
            state.last_error = error;
        }
        state.last_heartbeat = Instant::now();
    }

    /// Correct a stale `running` flag left behind by a writer that died
    /// without reaching its terminal update.
    pub fn mark_not_running(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        state.running = false;
        state.last_error = Some(reason.into());
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> LivenessSnapshot {
        self.state.lock().clone()
    }

    /// `running && now - last_heartbeat < timeout`
    pub fn is_alive(&self, timeout: Duration) -> bool {
        let state = self.state.lock();
        state.running && state.last_heartbeat.elapsed() < timeout
    }
}
