//! Bounded FIFO between the ingestion callback and the writer worker.
//!
//! The queue carries [`QueueItem`]s: either a [`Chunk`] of captured bytes or
//! an explicit stop request. Producers never wait: a full queue rejects the
//! newest chunk and the caller decides how loudly to complain. The consumer
//! waits for at most a caller-supplied interval so it can keep its heartbeat
//! fresh while the line is idle.
//!
//! ```text
//! source thread ──push_nonblocking──▶ [ capacity slots ] ──pop_bounded──▶ writer
//!                                         ▲
//!             supervisor / shutdown ──────┘ push_shutdown (bounded wait)
//! ```
//!
//! Built on a `crossbeam_channel::bounded` channel whose sender and receiver
//! are both owned here, so the channel can never disconnect while the queue
//! is alive.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default queue capacity in chunks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Immutable, owned run of captured bytes.
///
/// Always built by copying: the memory handed to the data callback belongs
/// to the source and may be overwritten as soon as the callback returns.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk(Bytes);

impl Chunk {
    /// Copy `data` into a new chunk.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length chunk.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the captured bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &self.0.len()).finish()
    }
}

/// Which writer generation a stop request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTarget {
    /// Every writer, current and future (session shutdown).
    All,
    /// Only the writer with this generation number (hang recovery).
    Generation(u64),
}

impl StopTarget {
    /// Whether a writer of `generation` must obey this request.
    pub fn applies_to(self, generation: u64) -> bool {
        match self {
            StopTarget::All => true,
            StopTarget::Generation(g) => g == generation,
        }
    }
}

/// Entry stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// Captured bytes awaiting the writer.
    Data(Chunk),
    /// Stop request, queued behind any data already accepted.
    Shutdown(StopTarget),
}

/// Result of a producer push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The chunk is in the queue.
    Accepted,
    /// The queue was full; the chunk was discarded.
    Dropped,
}

/// Result of a bounded consumer wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    /// Next chunk in arrival order.
    Data(Chunk),
    /// A stop request reached the head of the queue.
    Shutdown(StopTarget),
    /// Nothing arrived within the timeout.
    TimedOut,
}

/// Fixed-capacity, multi-producer FIFO with drop-newest overflow.
pub struct BoundedQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    capacity: usize,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl BoundedQueue {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is 0; configuration validation rejects that first.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `chunk` without waiting. A full queue drops the chunk.
    pub fn push_nonblocking(&self, chunk: Chunk) -> PushOutcome {
        match self.tx.try_send(QueueItem::Data(chunk)) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Accepted
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
        }
    }

    /// Enqueue a stop request, waiting up to `timeout` for a free slot.
    ///
    /// Returns `false` when the queue stayed full for the whole wait.
    pub fn push_shutdown(&self, target: StopTarget, timeout: Duration) -> bool {
        match self.tx.send_timeout(QueueItem::Shutdown(target), timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }

    /// Wait up to `timeout` for the next item.
    pub fn pop_bounded(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(QueueItem::Data(chunk)) => Pop::Data(chunk),
            Ok(QueueItem::Shutdown(target)) => Pop::Shutdown(target),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Pop::TimedOut,
        }
    }

    /// Take the next item if one is immediately available.
    pub fn try_pop(&self) -> Option<QueueItem> {
        self.rx.try_recv().ok()
    }

    /// Items currently queued, stop requests included.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when nothing is waiting for the writer.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks accepted since construction.
    pub fn accepted_chunks(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Chunks rejected because the queue was full.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for BoundedQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl fmt::Debug for BoundedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped_chunks())
            .finish()
    }
}
