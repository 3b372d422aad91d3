//! Shared helpers for the capture integration tests.
#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use log2bin::config::{CaptureConfig, PipelineConfig};
use log2bin::output::{FsOpener, OpenMode, OpenedOutput, OutputFile, OutputOpener};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Configuration with every interval shrunk to test scale.
pub fn fast_config() -> CaptureConfig {
    let mut config = CaptureConfig::default();
    config.source.port = "MOCK0".into();
    config.source.baud_rate = 115_200;
    config.pipeline = PipelineConfig {
        queue_capacity: 256,
        pop_timeout: Duration::from_millis(5),
        max_open_retries: 3,
        retry_backoff: Duration::from_millis(5),
        flush_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(10),
        heartbeat_timeout: Duration::from_millis(200),
        supervisor_poll_interval: Duration::from_millis(10),
        status_check_interval: Duration::from_millis(20),
        hang_join_timeout: Duration::from_millis(1_000),
        shutdown_join_timeout: Duration::from_millis(2_000),
        shutdown_retry_join_timeout: Duration::from_millis(500),
        max_restarts: 3,
        restart_backoff_first: Duration::from_millis(10),
        restart_backoff_max: Duration::from_millis(100),
        restart_backoff_factor: 2.0,
    };
    config
}

/// Poll `condition` every 2 ms for up to five seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Release handle for a [`GatedOpener`]; dropping it opens the gate.
pub type Gate = Sender<()>;

/// The first file opened blocks its first write until the gate is released,
/// which looks like a hung disk to the writer.
pub struct GatedOpener {
    gate: Mutex<Option<Receiver<()>>>,
}

impl GatedOpener {
    pub fn new() -> (Self, Gate) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (
            Self {
                gate: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

struct GatedFile {
    inner: Box<dyn OutputFile>,
    gate: Option<Receiver<()>>,
}

impl Write for GatedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutputFile for GatedFile {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }

    fn into_unflushed(self: Box<Self>) -> Vec<u8> {
        self.inner.into_unflushed()
    }
}

impl OutputOpener for GatedOpener {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<OpenedOutput> {
        let opened = FsOpener.open(path, mode)?;
        Ok(OpenedOutput {
            file: Box::new(GatedFile {
                inner: opened.file,
                gate: self.gate.lock().take(),
            }),
            existing_len: opened.existing_len,
        })
    }
}

/// The first open waits for the gate and then panics, killing writer
/// generation 0 before it consumes anything. The next `crashes - 1` opens
/// panic straight away; later opens succeed.
pub struct CrashingOpener {
    gate: Mutex<Option<Receiver<()>>>,
    opens: AtomicU32,
    crashes: u32,
}

impl CrashingOpener {
    pub fn new() -> (Self, Gate) {
        Self::with_crashes(1)
    }

    pub fn with_crashes(crashes: u32) -> (Self, Gate) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (
            Self {
                gate: Mutex::new(Some(rx)),
                opens: AtomicU32::new(0),
                crashes,
            },
            tx,
        )
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl OutputOpener for CrashingOpener {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<OpenedOutput> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if n <= self.crashes {
            panic!("writer crashed during open");
        }
        FsOpener.open(path, mode)
    }
}

/// Every open fails.
pub struct RefusingOpener;

impl OutputOpener for RefusingOpener {
    fn open(&self, _path: &Path, _mode: OpenMode) -> io::Result<OpenedOutput> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "volume is read-only"))
    }
}

/// Writes fail after `budget` successful writes; reopening is refused.
pub struct FailingDiskOpener {
    budget: usize,
    opens: AtomicU32,
}

impl FailingDiskOpener {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            opens: AtomicU32::new(0),
        }
    }
}

struct FailingDisk {
    inner: Box<dyn OutputFile>,
    remaining: usize,
}

impl Write for FailingDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "disk detached"));
        }
        self.remaining -= 1;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutputFile for FailingDisk {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }

    fn into_unflushed(self: Box<Self>) -> Vec<u8> {
        self.inner.into_unflushed()
    }
}

impl OutputOpener for FailingDiskOpener {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<OpenedOutput> {
        if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound, "disk detached"));
        }
        let opened = FsOpener.open(path, mode)?;
        Ok(OpenedOutput {
            file: Box::new(FailingDisk {
                inner: opened.file,
                remaining: self.budget,
            }),
            existing_len: opened.existing_len,
        })
    }
}
