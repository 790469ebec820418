//! # Outbound Audio Queue
//!
//! Bounded FIFO of synthesized-audio chunks sitting between the conversation
//! engine (producer) and the socket-writing pump (consumer). The engine
//! produces audio on its own tasks and must never be blocked by a slow
//! socket, so `push` always returns immediately and the queue sheds the
//! oldest chunk when full.
//!
//! ## Key Behaviors:
//! - **Non-blocking push**: A no-op once the queue is closed
//! - **Bounded latency**: Oldest chunk dropped at capacity
//! - **Timed drain**: The consumer waits a bounded interval so it can poll
//!   its stop flag between chunks
//! - **Clear barrier**: `clear()` runs under the same lock as push and
//!   drain, so no chunk enqueued before a clear is ever drained after it

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

/// State protected by the queue mutex.
struct QueueInner {
    chunks: VecDeque<Bytes>,
    closed: bool,
    dropped_chunks: u64,
}

/// Bounded, thread-safe FIFO of outbound audio chunks.
///
/// ## Thread Safety:
/// All mutation happens inside one `Mutex`, shared between the engine's
/// callback context and the pump task. A `Notify` wakes the pump when a
/// chunk arrives so the drain wait does not always run to its timeout.
pub struct OutputQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl OutputQueue {
    /// Create a queue holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::with_capacity(capacity),
                closed: false,
                dropped_chunks: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append a chunk without ever blocking the producer.
    ///
    /// ## Behavior:
    /// - Queue closed: the chunk is silently discarded
    /// - Queue full: the oldest chunk is dropped to keep latency bounded
    pub fn push(&self, chunk: Bytes) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }

            if inner.chunks.len() >= self.capacity {
                inner.chunks.pop_front();
                inner.dropped_chunks += 1;
                debug!(
                    dropped_total = inner.dropped_chunks,
                    "Output queue full, dropped oldest chunk"
                );
            }

            inner.chunks.push_back(chunk);
        }

        self.notify.notify_one();
    }

    /// Wait up to `wait` for the next chunk.
    ///
    /// ## Returns:
    /// - **Some(chunk)**: The oldest queued chunk, in enqueue order
    /// - **None**: The wait elapsed with nothing queued, or the queue is
    ///   closed (callers use the empty result to poll their stop flag)
    pub async fn drain_with_timeout(&self, wait: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(chunk) = inner.chunks.pop_front() {
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let remaining = deadline.duration_since(now);
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Atomically discard everything queued so far.
    ///
    /// Used on interruption: when the caller starts speaking, pending agent
    /// audio must vanish immediately instead of playing over them.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.chunks.clear();
    }

    /// Close the queue: future pushes become no-ops and any waiting drain
    /// wakes up with an empty result. Queued chunks are discarded.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.chunks.clear();
        }

        self.notify.notify_waiters();
    }

    /// Number of chunks currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    /// Check whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().chunks.is_empty()
    }

    /// Check whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Total chunks shed because the queue was at capacity.
    pub fn dropped_chunks(&self) -> u64 {
        self.inner.lock().unwrap().dropped_chunks
    }
}
