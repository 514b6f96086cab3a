//! Per-core local batcher (§4.2).
//!
//! Each emulated core accumulates packets here before they are handed to the
//! ring in one bulk `push`, which amortizes the cost of the cross-thread
//! cursor handoff. A batcher is owned by exactly one producer thread; the
//! mutex only exists to let a concurrent `flush` (e.g. triggered by a
//! barrier from another thread) observe a consistent buffer.

use parking_lot::Mutex;

use crate::constants::LOCAL_BATCHER_SIZE;

struct Inner<T: Copy> {
    buffer: Vec<T>,
}

/// Fixed-capacity staging buffer for one core's packets.
pub struct Batcher<T: Copy> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T: Copy> Batcher<T> {
    pub fn new() -> Self {
        Self::with_capacity(LOCAL_BATCHER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Batcher { inner: Mutex::new(Inner { buffer: Vec::with_capacity(capacity) }), capacity }
    }

    /// Append one packet. Returns `false` without modifying the buffer if it
    /// is already full — the caller is expected to flush first.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.buffer.len() >= self.capacity {
            return false;
        }
        inner.buffer.push(item);
        true
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().buffer.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Drain the buffer through `sink` (typically `ring.push`) and reset it.
    /// No-op if the buffer is currently empty.
    pub fn flush(&self, sink: impl FnOnce(&[T])) {
        let mut inner = self.inner.lock();
        if inner.buffer.is_empty() {
            return;
        }
        sink(&inner.buffer);
        inner.buffer.clear();
    }
}

impl<T: Copy> Default for Batcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_then_rejects() {
        let batcher: Batcher<u64> = Batcher::with_capacity(2);
        assert!(batcher.push(1));
        assert!(batcher.push(2));
        assert!(!batcher.push(3));
        assert!(batcher.is_full());
    }

    #[test]
    fn flush_resets_buffer() {
        let batcher: Batcher<u64> = Batcher::with_capacity(4);
        batcher.push(10);
        batcher.push(20);

        let mut seen = Vec::new();
        batcher.flush(|items| seen.extend_from_slice(items));

        assert_eq!(seen, vec![10, 20]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn flush_on_empty_is_noop() {
        let batcher: Batcher<u64> = Batcher::with_capacity(4);
        let mut calls = 0;
        batcher.flush(|_| calls += 1);
        assert_eq!(calls, 0);
    }
}
