//! Serial-port ingestion source.
//!
//! Opens the port with `serialport` and runs a dedicated reader thread that
//! hands every read straight to the data callback. The read buffer is reused
//! between reads; the bridge copies what it needs before returning.
//!
//! Reads use a short timeout so the reader notices `close` promptly. A read
//! fault other than a timeout is reported through the error callback and
//! ends the reader.

use super::{status, IngestionSource, SourceCallbacks, StatusCode};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Hardware-backed source.
pub struct SerialSource {
    buffer_len: usize,
    port: Option<Box<dyn SerialPort>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl Default for SerialSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialSource {
    /// Closed source with the default 64 KiB read buffer.
    pub fn new() -> Self {
        Self {
            buffer_len: DEFAULT_READ_BUFFER,
            port: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Size of the buffer handed to each read.
    pub fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len.max(1);
        self
    }
}

fn status_for(err: &serialport::Error) -> StatusCode {
    match err.kind() {
        serialport::ErrorKind::NoDevice => status::NO_DEVICE,
        serialport::ErrorKind::InvalidInput => status::INVALID_INPUT,
        serialport::ErrorKind::Io(_) => status::IO,
        serialport::ErrorKind::Unknown => status::UNKNOWN,
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    buffer_len: usize,
    callbacks: Arc<dyn SourceCallbacks>,
    stop: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; buffer_len];
    while !stop.load(Ordering::Acquire) {
        match port.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => callbacks.on_data(&buffer[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                error!(error = %e, "serial read failed");
                callbacks.on_error(status::IO, &e.to_string());
                open.store(false, Ordering::Release);
                return;
            }
        }
    }
    debug!("serial reader stopped");
}

impl IngestionSource for SerialSource {
    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
        callbacks: Arc<dyn SourceCallbacks>,
    ) -> Result<(), StatusCode> {
        if self.open.load(Ordering::Acquire) {
            return Err(status::ALREADY_OPEN);
        }

        let serial = serialport::new(port, baud_rate)
            .timeout(READ_TIMEOUT)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                error!(port, baud_rate, error = %e, "failed to open serial port");
                status_for(&e)
            })?;
        let reader_port = serial.try_clone().map_err(|e| {
            error!(port, error = %e, "failed to clone serial port handle");
            status_for(&e)
        })?;

        self.stop.store(false, Ordering::Release);
        self.open.store(true, Ordering::Release);

        let stop = Arc::clone(&self.stop);
        let open = Arc::clone(&self.open);
        let buffer_len = self.buffer_len;
        let reader = thread::Builder::new()
            .name(format!("serial-reader-{port}"))
            .spawn(move || read_loop(reader_port, buffer_len, callbacks, stop, open))
            .map_err(|e| {
                error!(error = %e, "failed to spawn serial reader");
                self.open.store(false, Ordering::Release);
                status::UNKNOWN
            })?;

        self.reader = Some(reader);
        self.port = Some(serial);
        info!(port, baud_rate, "serial port opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StatusCode> {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            // Bounded by the read timeout.
            if reader.join().is_err() {
                error!("serial reader panicked");
            }
        }
        self.port = None;
        self.open.store(false, Ordering::Release);
        info!("serial port closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StatusCode> {
        let port = self.port.as_mut().ok_or(status::NOT_OPEN)?;
        port.write_all(data).map_err(|e| {
            error!(error = %e, "serial write failed");
            status::IO
        })
    }
}

impl Drop for SerialSource {
    fn drop(&mut self) {
        if self.reader.is_some() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Discard;

    impl SourceCallbacks for Discard {
        fn on_data(&self, _data: &[u8]) {}
        fn on_error(&self, _code: StatusCode, _message: &str) {}
    }

    #[test]
    fn missing_port_fails_to_open() {
        let mut source = SerialSource::new();
        let result = source.open("/dev/log2bin-no-such-port", 9600, Arc::new(Discard));
        assert!(result.is_err());
        assert_ne!(result, Err(status::OK));
        assert!(!source.is_open());
    }

    #[test]
    fn write_before_open_is_rejected() {
        let mut source = SerialSource::new();
        assert_eq!(source.write(b"x"), Err(status::NOT_OPEN));
    }

    #[test]
    fn close_without_open_is_harmless() {
        let mut source = SerialSource::new().with_buffer_len(0);
        assert!(source.close().is_ok());
        assert!(!source.is_open());
    }
}
