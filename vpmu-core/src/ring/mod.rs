//! Multi-reader SPMC ring buffer (§4.1).
//!
//! A fixed-capacity circular queue with one producer and `K` independent
//! readers, each advancing its own cursor. A packet pushed by the producer
//! is visible to *every* reader until that reader has consumed it — this is
//! broadcast, not work-stealing: two readers observe the same sequence of
//! packets, not a partition of it.

pub mod local;
pub mod shared;

pub use local::LocalRing;
pub use shared::SharedRing;

use crate::constants::MAX_WORKERS;

/// Cache-line padded `u64` cursor, preventing false sharing between the
/// writer cursor and each reader's cursor (and between readers themselves).
#[repr(align(64))]
pub struct Cursor(std::sync::atomic::AtomicU64);

impl Cursor {
    pub fn new(initial: u64) -> Self {
        Cursor(std::sync::atomic::AtomicU64::new(initial))
    }

    #[inline(always)]
    pub fn load(&self, order: std::sync::atomic::Ordering) -> u64 {
        self.0.load(order)
    }

    #[inline(always)]
    pub fn store(&self, value: u64, order: std::sync::atomic::Ordering) {
        self.0.store(value, order)
    }
}

/// Contract shared by the in-process and shared-memory ring implementations.
///
/// `T` must be `Copy` (packets are plain-old-data) and the buffer is
/// addressed element-wise; callers may choose any fixed-size packet type
/// per stream kind.
pub trait Ring<T: Copy> {
    /// Register a new reader and return its id. Only legal before the
    /// first `push` (§4.1 edge cases).
    fn register_reader(&self) -> usize;

    /// Number of slots free for writing, computed against the slowest
    /// reader currently registered. The producer backends spin-nap on this
    /// before calling `push`.
    fn remained_space(&self) -> u64;

    /// Write `refs` into the ring, spin-napping while there isn't enough
    /// room. Writes are atomic with respect to every reader: no reader ever
    /// observes a partially-written batch.
    fn push(&self, refs: &[T]);

    /// Drain up to `out.len()` packets for reader `id`, returning how many
    /// were copied. Non-destructive with respect to other readers.
    fn pop(&self, id: usize, out: &mut [T]) -> usize;

    /// True if reader `id` has consumed everything the writer has
    /// published so far.
    fn empty(&self, id: usize) -> bool;

    /// Total slot capacity.
    fn capacity(&self) -> usize;
}

pub(crate) fn check_capacity(capacity: usize) -> crate::error::Result<()> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(crate::error::VpmuError::config("ring capacity must be a power of 2"));
    }
    Ok(())
}

pub(crate) fn check_reader_count(count: usize) -> crate::error::Result<()> {
    if count >= MAX_WORKERS {
        return Err(crate::error::VpmuError::config(format!(
            "cannot register more than {MAX_WORKERS} readers"
        )));
    }
    Ok(())
}
