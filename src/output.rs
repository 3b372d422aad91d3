//! Output file access for the writer worker.
//!
//! The writer never touches `std::fs` directly; it goes through an
//! [`OutputOpener`]. Production uses [`FsOpener`], which buffers writes in a
//! [`BufferedOutput`] and syncs them to stable storage on flush. Tests
//! substitute openers that fail or panic on demand.
//!
//! A buffered handle whose device fails still owns the bytes it accepted but
//! never wrote out. [`OutputFile::into_unflushed`] hands them back so a writer
//! can replay them into a fresh handle.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Write buffer used by [`FsOpener`].
const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// How an existing file at the output path is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start a new capture, discarding previous contents.
    Truncate,
    /// Continue a capture left behind by an earlier writer.
    Append,
}

/// A writable capture file.
pub trait OutputFile: Write + Send {
    /// Push buffered bytes down to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    /// Release the handle without flushing, returning bytes accepted by
    /// `write` that never reached the device.
    fn into_unflushed(self: Box<Self>) -> Vec<u8> {
        Vec::new()
    }
}

/// An opened output together with the bytes it already contained.
pub struct OpenedOutput {
    /// Handle positioned at the end of the file.
    pub file: Box<dyn OutputFile>,
    /// File length at open time; `0` after truncation.
    pub existing_len: u64,
}

/// Opens capture files. Shared between successive writer generations.
pub trait OutputOpener: Send + Sync {
    /// Open `path`, truncating or appending according to `mode`.
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<OpenedOutput>;
}

/// Unbuffered destination beneath a [`BufferedOutput`].
pub trait SyncSink: Write + Send {
    /// Persist everything written so far.
    fn sync_data(&mut self) -> io::Result<()>;
}

impl SyncSink for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// Write-buffered output over a [`SyncSink`].
pub struct BufferedOutput<S: SyncSink> {
    inner: BufWriter<S>,
}

impl<S: SyncSink> BufferedOutput<S> {
    /// Buffer up to `capacity` bytes in front of `sink`.
    pub fn with_capacity(capacity: usize, sink: S) -> Self {
        Self {
            inner: BufWriter::with_capacity(capacity, sink),
        }
    }
}

impl<S: SyncSink> Write for BufferedOutput<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: SyncSink> OutputFile for BufferedOutput<S> {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_mut().sync_data()
    }

    fn into_unflushed(self: Box<Self>) -> Vec<u8> {
        let (_sink, buffered) = self.inner.into_parts();
        buffered.unwrap_or_else(|panicked| panicked.into_inner())
    }
}

/// Filesystem-backed opener. Creates missing parent directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOpener;

impl OutputOpener for FsOpener {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<OpenedOutput> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            OpenMode::Truncate => options.write(true).truncate(true),
            OpenMode::Append => options.append(true),
        };
        let file = options.open(path)?;
        let existing_len = match mode {
            OpenMode::Truncate => 0,
            OpenMode::Append => file.metadata()?.len(),
        };

        Ok(OpenedOutput {
            file: Box::new(BufferedOutput::with_capacity(WRITE_BUFFER_BYTES, file)),
            existing_len,
        })
    }
}
