//! Process-local ring buffer backing the multi-thread backend (§4.4.2).
//!
//! Storage lives on the heap of the producer's process; cursors are plain
//! atomics. This is the fast path used whenever every worker lives in the
//! producer's address space.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{check_capacity, check_reader_count, Cursor, Ring};
use crate::constants::MAX_WORKERS;
use crate::error::Result;

pub struct LocalRing<T: Copy> {
    buffer: Box<[T]>,
    mask: u64,
    capacity: u64,
    started: AtomicBool,
    num_readers: AtomicUsize,
    writer: Cursor,
    readers: Vec<Cursor>,
}

impl<T: Copy + Default> LocalRing<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        let buffer = (0..capacity).map(|_| T::default()).collect::<Vec<_>>().into_boxed_slice();
        let readers = (0..MAX_WORKERS).map(|_| Cursor::new(0)).collect();

        Ok(LocalRing {
            buffer,
            mask: (capacity - 1) as u64,
            capacity: capacity as u64,
            started: AtomicBool::new(false),
            num_readers: AtomicUsize::new(0),
            writer: Cursor::new(0),
            readers,
        })
    }

    #[inline(always)]
    fn slot_ptr(&self, seq: u64) -> *mut T {
        let idx = (seq & self.mask) as usize;
        unsafe { self.buffer.as_ptr().add(idx) as *mut T }
    }

    fn min_reader_cursor(&self) -> u64 {
        let n = self.num_readers.load(Ordering::Acquire);
        if n == 0 {
            return self.writer.load(Ordering::Relaxed);
        }
        (0..n).map(|i| self.readers[i].load(Ordering::Relaxed)).min().unwrap()
    }
}

impl<T: Copy + Default> Ring<T> for LocalRing<T> {
    fn register_reader(&self) -> usize {
        assert!(
            !self.started.load(Ordering::Acquire),
            "readers must register before the first push"
        );
        let id = self.num_readers.fetch_add(1, Ordering::AcqRel);
        check_reader_count(id + 1).expect("too many readers");
        self.readers[id].store(0, Ordering::Relaxed);
        id
    }

    fn remained_space(&self) -> u64 {
        let w = self.writer.load(Ordering::Relaxed);
        let r = self.min_reader_cursor();
        self.capacity - (w - r)
    }

    fn push(&self, refs: &[T]) {
        self.started.store(true, Ordering::Release);
        debug_assert!(
            refs.len() as u64 <= self.capacity / 2,
            "a single push must not exceed half the ring capacity"
        );

        let mut w = self.writer.load(Ordering::Relaxed);
        while self.remained_space() < refs.len() as u64 {
            std::thread::sleep(crate::constants::BACKPRESSURE_SLEEP);
        }

        for (i, item) in refs.iter().enumerate() {
            unsafe { std::ptr::write_volatile(self.slot_ptr(w + i as u64), *item) };
        }
        std::sync::atomic::fence(Ordering::Release);
        w += refs.len() as u64;
        self.writer.store(w, Ordering::Release);
    }

    fn pop(&self, id: usize, out: &mut [T]) -> usize {
        let w = self.writer.load(Ordering::Acquire);
        let r = self.readers[id].load(Ordering::Relaxed);
        let available = (w - r).min(out.len() as u64) as usize;

        for (i, slot) in out.iter_mut().enumerate().take(available) {
            *slot = unsafe { std::ptr::read_volatile(self.slot_ptr(r + i as u64)) };
        }
        if available > 0 {
            self.readers[id].store(r + available as u64, Ordering::Release);
        }
        available
    }

    fn empty(&self, id: usize) -> bool {
        self.writer.load(Ordering::Acquire) == self.readers[id].load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

unsafe impl<T: Copy + Send> Send for LocalRing<T> {}
unsafe impl<T: Copy + Send> Sync for LocalRing<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_reader_round_trip() {
        let ring = LocalRing::<u64>::new(16).unwrap();
        let id = ring.register_reader();

        ring.push(&[1, 2, 3]);

        let mut out = [0u64; 8];
        let n = ring.pop(id, &mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert!(ring.empty(id));
    }

    #[test]
    fn broadcast_to_every_reader() {
        let ring = LocalRing::<u64>::new(16).unwrap();
        let a = ring.register_reader();
        let b = ring.register_reader();

        ring.push(&[10, 20, 30]);

        let mut out_a = [0u64; 8];
        let mut out_b = [0u64; 8];
        assert_eq!(ring.pop(a, &mut out_a), 3);
        assert_eq!(ring.pop(b, &mut out_b), 3);
        assert_eq!(&out_a[..3], &[10, 20, 30]);
        assert_eq!(&out_b[..3], &[10, 20, 30]);
    }

    #[test]
    fn remained_space_tracks_slowest_reader() {
        let ring = LocalRing::<u64>::new(8).unwrap();
        let fast = ring.register_reader();
        let slow = ring.register_reader();

        ring.push(&[1, 2, 3]);
        let mut buf = [0u64; 8];
        ring.pop(fast, &mut buf);

        // `slow` hasn't consumed anything yet, so space is bounded by it.
        assert_eq!(ring.remained_space(), 5);
        ring.pop(slow, &mut buf);
        assert_eq!(ring.remained_space(), 8);
    }

    #[test]
    fn wraparound_preserves_order() {
        let ring = LocalRing::<u64>::new(4).unwrap();
        let id = ring.register_reader();
        let mut buf = [0u64; 4];

        for round in 0..5u64 {
            ring.push(&[round * 10, round * 10 + 1]);
            let n = ring.pop(id, &mut buf);
            assert_eq!(n, 2);
            assert_eq!(&buf[..2], &[round * 10, round * 10 + 1]);
        }
    }
}
