//! Reusable body-capture buffers.
//!
//! Every captured request or response body lands in a [`BytesMut`] taken from
//! a [`BufferPool`]. Once the taps for that request have returned, the buffer
//! goes back to the pool and may be handed to an unrelated request straight
//! away. That is why taps only ever see captured bodies by reference.
//!
//! Buffers that grew past the retention threshold are dropped on return so
//! that one large upload does not pin its memory in the pool forever.

use std::sync::{Arc, LazyLock};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::debug;

/// Largest capacity a returned buffer may have and still be kept.
pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 4 * 1024;

/// Upper bound on idle buffers kept around.
pub const DEFAULT_MAX_IDLE: usize = 1024;

static DEFAULT: LazyLock<Arc<BufferPool>> = LazyLock::new(|| Arc::new(BufferPool::new()));

/// A pool of growable byte buffers for body capture.
///
/// `get` and `put` take `&self` and are safe to call from any number of
/// tasks at once. No ordering is promised: two successive `get` calls may or
/// may not return the buffer that was just `put`.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_RETAINED_CAPACITY, DEFAULT_MAX_IDLE)
    }

    /// Pool that keeps at most `max_idle` buffers, none larger than
    /// `max_capacity` bytes.
    pub fn with_limits(max_capacity: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_capacity,
            max_idle,
        }
    }

    /// The process-wide pool used when no explicit pool is configured.
    pub fn shared() -> Arc<BufferPool> {
        Arc::clone(&DEFAULT)
    }

    /// Returns an empty buffer, reclaimed or freshly allocated.
    pub fn get(&self) -> BytesMut {
        match self.free.lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::new(),
        }
    }

    /// Hands a buffer back. `None` is ignored, as is any buffer whose
    /// capacity exceeds the retention threshold.
    pub fn put(&self, buf: impl Into<Option<BytesMut>>) {
        let Some(buf) = buf.into() else { return };

        let cap = buf.capacity();
        if cap > self.max_capacity {
            debug!(cap, max = self.max_capacity, "discarding oversized capture buffer");
            return;
        }

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    /// Number of idle buffers currently retained.
    pub fn retained(&self) -> usize {
        self.free.lock().len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
