//! Mock ingestion source.
//!
//! Stands in for the hardware driver in tests and in `--simulate` mode.
//! Bytes reach the callbacks in two ways:
//!
//! - Manually, from any thread, through a [`MockHandle`].
//! - From a generator thread started on `open`, driven by a [`MockScript`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use log2bin::source::mock::MockSource;
//! use log2bin::source::{IngestionSource, SourceCallbacks};
//!
//! struct Print;
//! impl SourceCallbacks for Print {
//!     fn on_data(&self, data: &[u8]) { println!("{} bytes", data.len()); }
//!     fn on_error(&self, code: i32, message: &str) { println!("{code}: {message}"); }
//! }
//!
//! let mut source = MockSource::new();
//! let handle = source.handle();
//! source.open("MOCK", 115_200, Arc::new(Print)).unwrap();
//! assert!(handle.deliver(b"hello"));
//! source.close().unwrap();
//! assert!(!handle.deliver(b"ignored"));
//! ```

use super::{status, IngestionSource, SourceCallbacks, StatusCode};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// What the generator thread delivers after `open`.
pub struct MockScript {
    chunks: Box<dyn Iterator<Item = Vec<u8>> + Send>,
    interval: Duration,
    close_when_done: bool,
}

impl MockScript {
    /// Deliver `chunks` back to back, then report the source closed.
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: Box::new(chunks.into_iter()),
            interval: Duration::ZERO,
            close_when_done: true,
        }
    }

    /// Endless wrapping byte counter in `chunk_len`-byte deliveries.
    pub fn counting(chunk_len: usize, interval: Duration) -> Self {
        let mut next = 0u8;
        let chunks = std::iter::repeat_with(move || {
            (0..chunk_len)
                .map(|_| {
                    let byte = next;
                    next = next.wrapping_add(1);
                    byte
                })
                .collect()
        });
        Self {
            chunks: Box::new(chunks),
            interval,
            close_when_done: false,
        }
    }

    /// Pause between deliveries.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Default)]
struct MockShared {
    callbacks: RwLock<Option<Arc<dyn SourceCallbacks>>>,
    open: AtomicBool,
    stop: AtomicBool,
    written: Mutex<Vec<u8>>,
}

impl MockShared {
    /// Holds the read lock for the whole callback so `close` can wait
    /// for in-flight deliveries.
    fn deliver(&self, data: &[u8]) -> bool {
        let callbacks = self.callbacks.read();
        match callbacks.as_ref() {
            Some(cb) if self.open.load(Ordering::Acquire) => {
                cb.on_data(data);
                true
            }
            _ => false,
        }
    }

    fn raise_error(&self, code: StatusCode, message: &str) -> bool {
        let callbacks = self.callbacks.read();
        match callbacks.as_ref() {
            Some(cb) if self.open.load(Ordering::Acquire) => {
                cb.on_error(code, message);
                true
            }
            _ => false,
        }
    }
}

/// Cloneable remote control for a [`MockSource`].
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    /// Invoke the data callback. Returns `false` when the source is closed.
    pub fn deliver(&self, data: &[u8]) -> bool {
        self.shared.deliver(data)
    }

    /// Invoke the error callback. Returns `false` when the source is closed.
    pub fn raise_error(&self, code: StatusCode, message: &str) -> bool {
        self.shared.raise_error(code, message)
    }

    /// Whether the source is currently open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Bytes passed to [`IngestionSource::write`].
    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().clone()
    }
}

/// Scriptable in-process source.
pub struct MockSource {
    shared: Arc<MockShared>,
    script: Option<MockScript>,
    fail_open: Option<StatusCode>,
    generator: Option<JoinHandle<()>>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    /// Source with no generator; drive it through [`MockSource::handle`].
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared::default()),
            script: None,
            fail_open: None,
            generator: None,
        }
    }

    /// Generate data from `script` on a background thread once opened.
    pub fn with_script(mut self, script: MockScript) -> Self {
        self.script = Some(script);
        self
    }

    /// Make `open` fail with `code`.
    pub fn failing_open(mut self, code: StatusCode) -> Self {
        self.fail_open = Some(code);
        self
    }

    /// Handle for injecting deliveries from a test.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn spawn_generator(&mut self, script: MockScript) -> Result<(), StatusCode> {
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("mock-source".into())
            .spawn(move || run_script(&shared, script))
            .map_err(|_| status::UNKNOWN)?;
        self.generator = Some(thread);
        Ok(())
    }
}

fn run_script(shared: &MockShared, script: MockScript) {
    let mut delivered = 0usize;
    for chunk in script.chunks {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        if !shared.deliver(&chunk) {
            return;
        }
        delivered += 1;
        if !script.interval.is_zero() {
            thread::sleep(script.interval);
        }
    }
    debug!(delivered, "mock script finished");
    if script.close_when_done {
        shared.open.store(false, Ordering::Release);
    }
}

impl IngestionSource for MockSource {
    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
        callbacks: Arc<dyn SourceCallbacks>,
    ) -> Result<(), StatusCode> {
        if let Some(code) = self.fail_open {
            return Err(code);
        }
        if self.shared.open.load(Ordering::Acquire) {
            return Err(status::ALREADY_OPEN);
        }

        *self.shared.callbacks.write() = Some(callbacks);
        self.shared.stop.store(false, Ordering::Release);
        self.shared.open.store(true, Ordering::Release);
        info!(port, baud_rate, "mock source opened");

        if let Some(script) = self.script.take() {
            if let Err(code) = self.spawn_generator(script) {
                self.shared.open.store(false, Ordering::Release);
                *self.shared.callbacks.write() = None;
                return Err(code);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), StatusCode> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.open.store(false, Ordering::Release);
        if let Some(generator) = self.generator.take() {
            if generator.join().is_err() {
                debug!("mock generator panicked");
            }
        }
        // Waits out any delivery still holding the read lock.
        *self.shared.callbacks.write() = None;
        info!("mock source closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StatusCode> {
        if !self.is_open() {
            return Err(status::NOT_OPEN);
        }
        self.shared.written.lock().extend_from_slice(data);
        Ok(())
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        if self.generator.is_some() {
            let _ = self.close();
        }
    }
}
