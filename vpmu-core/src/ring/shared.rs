//! File-backed, `mmap`-shared ring buffer backing the multi-process backend
//! (§4.4.3).
//!
//! The layout is a fixed header (magic, version, capacity, a producer
//! cursor, and `MAX_WORKERS` cache-line padded reader cursors) followed by
//! the slot array, all in one `MAP_SHARED` region so the forked workers and
//! the producer see the same memory without any explicit IPC call.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{check_capacity, Ring};
use crate::constants::MAX_WORKERS;
use crate::error::{Result, VpmuError};

const MAGIC: u64 = 0x5650_4d55_5348_4152; // "VPMUSHAR"
const VERSION: u32 = 1;

#[repr(align(64))]
struct PaddedCursor(AtomicU64);

/// Layout mirrored bit-for-bit between every process that maps this file.
#[repr(C, align(64))]
struct SharedHeader {
    magic: u64,
    version: u32,
    capacity: u32,
    slot_size: u32,
    num_readers: std::sync::atomic::AtomicU32,
    started: std::sync::atomic::AtomicU32,
    _pad0: [u8; 40],

    writer: PaddedCursor,
    readers: [PaddedCursor; MAX_WORKERS],
}

impl SharedHeader {
    const SIZE: usize = std::mem::size_of::<SharedHeader>();
}

/// A `Ring<T>` whose storage is an `mmap`'d file, shared between the
/// producer process and every forked worker process.
pub struct SharedRing<T: Copy> {
    mmap_ptr: *mut u8,
    mmap_len: usize,
    mask: u64,
    capacity: u64,
    slot_size: usize,
    _file: std::fs::File,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Copy> SharedRing<T> {
    /// Create the backing file and initialize the header (producer side).
    /// Must be called before any worker process is forked.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;

        let slot_size = std::mem::size_of::<T>();
        let file_size = SharedHeader::SIZE + capacity * slot_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(file_size as u64)?;

        let mmap_ptr = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                file_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(VpmuError::Io(std::io::Error::last_os_error()));
            }
            ptr as *mut u8
        };

        let header = unsafe { &mut *(mmap_ptr as *mut SharedHeader) };
        header.magic = MAGIC;
        header.version = VERSION;
        header.capacity = capacity as u32;
        header.slot_size = slot_size as u32;
        header.num_readers = std::sync::atomic::AtomicU32::new(0);
        header.started = std::sync::atomic::AtomicU32::new(0);
        header.writer.0.store(0, Ordering::Relaxed);
        for r in header.readers.iter() {
            r.0.store(0, Ordering::Relaxed);
        }

        unsafe {
            std::ptr::write_bytes(mmap_ptr.add(SharedHeader::SIZE), 0, capacity * slot_size);
        }

        Ok(SharedRing {
            mmap_ptr,
            mmap_len: file_size,
            mask: (capacity - 1) as u64,
            capacity: capacity as u64,
            slot_size,
            _file: file,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Map an already-created ring (worker side, after fork or `exec`-less
    /// attach). Validates magic, version and slot size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len() as usize;

        let mmap_ptr = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                file_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(VpmuError::Io(std::io::Error::last_os_error()));
            }
            ptr as *mut u8
        };

        let header = unsafe { &*(mmap_ptr as *const SharedHeader) };
        if header.magic != MAGIC {
            unsafe { libc::munmap(mmap_ptr as *mut _, file_size) };
            return Err(VpmuError::config("shared ring: bad magic"));
        }
        if header.version != VERSION {
            unsafe { libc::munmap(mmap_ptr as *mut _, file_size) };
            return Err(VpmuError::config("shared ring: version mismatch"));
        }
        if header.slot_size as usize != std::mem::size_of::<T>() {
            unsafe { libc::munmap(mmap_ptr as *mut _, file_size) };
            return Err(VpmuError::config("shared ring: slot size mismatch"));
        }

        let capacity = header.capacity as u64;
        Ok(SharedRing {
            mmap_ptr,
            mmap_len: file_size,
            mask: capacity - 1,
            capacity,
            slot_size: header.slot_size as usize,
            _file: file,
            _phantom: std::marker::PhantomData,
        })
    }

    #[inline(always)]
    fn header(&self) -> &SharedHeader {
        unsafe { &*(self.mmap_ptr as *const SharedHeader) }
    }

    #[inline(always)]
    fn slot_ptr(&self, seq: u64) -> *mut T {
        let index = (seq & self.mask) as usize;
        let offset = SharedHeader::SIZE + index * self.slot_size;
        unsafe { self.mmap_ptr.add(offset) as *mut T }
    }

    fn min_reader_cursor(&self) -> u64 {
        let h = self.header();
        let n = h.num_readers.load(Ordering::Acquire) as usize;
        if n == 0 {
            return h.writer.0.load(Ordering::Relaxed);
        }
        (0..n).map(|i| h.readers[i].0.load(Ordering::Relaxed)).min().unwrap()
    }
}

impl<T: Copy> Ring<T> for SharedRing<T> {
    fn register_reader(&self) -> usize {
        let h = self.header();
        assert_eq!(
            h.started.load(Ordering::Acquire),
            0,
            "readers must register before the first push"
        );
        let id = h.num_readers.fetch_add(1, Ordering::AcqRel) as usize;
        assert!(id < MAX_WORKERS, "cannot register more than {MAX_WORKERS} readers");
        h.readers[id].0.store(0, Ordering::Relaxed);
        id
    }

    fn remained_space(&self) -> u64 {
        let w = self.header().writer.0.load(Ordering::Relaxed);
        let r = self.min_reader_cursor();
        self.capacity - (w - r)
    }

    fn push(&self, refs: &[T]) {
        self.header().started.store(1, Ordering::Release);

        let mut w = self.header().writer.0.load(Ordering::Relaxed);
        while self.remained_space() < refs.len() as u64 {
            std::thread::sleep(crate::constants::BACKPRESSURE_SLEEP);
        }

        for (i, item) in refs.iter().enumerate() {
            unsafe { std::ptr::write_volatile(self.slot_ptr(w + i as u64), *item) };
        }
        std::sync::atomic::fence(Ordering::Release);
        w += refs.len() as u64;
        self.header().writer.0.store(w, Ordering::Release);
    }

    fn pop(&self, id: usize, out: &mut [T]) -> usize {
        let h = self.header();
        let w = h.writer.0.load(Ordering::Acquire);
        let r = h.readers[id].0.load(Ordering::Relaxed);
        let available = (w - r).min(out.len() as u64) as usize;

        for (i, slot) in out.iter_mut().enumerate().take(available) {
            *slot = unsafe { std::ptr::read_volatile(self.slot_ptr(r + i as u64)) };
        }
        if available > 0 {
            h.readers[id].0.store(r + available as u64, Ordering::Release);
        }
        available
    }

    fn empty(&self, id: usize) -> bool {
        let h = self.header();
        h.writer.0.load(Ordering::Acquire) == h.readers[id].0.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl<T: Copy> Drop for SharedRing<T> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_ptr as *mut _, self.mmap_len);
        }
    }
}

// Safety: the ring is explicitly designed to be mapped into multiple
// processes/threads at once; every mutable access goes through atomics or
// volatile accesses synchronized by them.
unsafe impl<T: Copy + Send> Send for SharedRing<T> {}
unsafe impl<T: Copy + Send> Sync for SharedRing<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    struct Slot(u64);

    #[test]
    fn create_open_round_trip() {
        let path = std::env::temp_dir().join(format!("vpmu-shared-ring-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let producer = SharedRing::<Slot>::create(&path, 16).unwrap();
        let consumer = SharedRing::<Slot>::open(&path).unwrap();
        let id = producer.register_reader();

        producer.push(&[Slot(1), Slot(2)]);

        let mut out = [Slot(0); 8];
        let n = consumer.pop(id, &mut out);
        assert_eq!(n, 2);
        assert_eq!(&out[..2], &[Slot(1), Slot(2)]);

        drop(producer);
        drop(consumer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_wrong_magic() {
        let path = std::env::temp_dir().join(format!("vpmu-shared-ring-badmagic-{}", std::process::id()));
        std::fs::write(&path, vec![0u8; SharedHeader::SIZE + 64]).unwrap();

        let err = SharedRing::<Slot>::open(&path).unwrap_err();
        assert!(matches!(err, VpmuError::Config { .. }));

        let _ = std::fs::remove_file(&path);
    }
}
