//! Thin wrapper over POSIX counting semaphores.
//!
//! Used as the worker wake-up primitive for both concurrent backends: the
//! multi-thread backend places these in ordinary heap memory (`pshared =
//! false`), the multi-process backend places them inside the `mmap`'d
//! shared-memory region (`pshared = true`) so `sem_post`/`sem_wait` work
//! across the fork boundary.

use crate::error::{Result, VpmuError};

/// A `sem_t` that the caller is responsible for placing in memory that
/// outlives every thread/process using it (heap allocation for
/// single-process use, shared memory for cross-process use).
#[repr(transparent)]
pub struct Semaphore(libc::sem_t);

impl Semaphore {
    /// Initialize `self` in place. `pshared` must be `true` when this
    /// semaphore lives in a `MAP_SHARED` region used by multiple processes.
    ///
    /// # Safety
    /// `self` must not already be initialized, and must not move in memory
    /// for as long as any thread/process holds a reference to it.
    pub unsafe fn init(&mut self, pshared: bool, value: u32) -> Result<()> {
        let rc = libc::sem_init(&mut self.0, pshared as i32, value);
        if rc != 0 {
            return Err(VpmuError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn post(&self) {
        unsafe {
            libc::sem_post(&self.0 as *const _ as *mut _);
        }
    }

    pub fn wait(&self) {
        loop {
            let rc = unsafe { libc::sem_wait(&self.0 as *const _ as *mut _) };
            if rc == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                // EINTR is routine (signal delivery); anything else means
                // the semaphore was misused.
                tracing::error!(error = %err, "sem_wait failed");
                return;
            }
        }
    }

    /// # Safety
    /// No thread/process may use `self` after this call.
    pub unsafe fn destroy(&mut self) {
        libc::sem_destroy(&mut self.0);
    }
}

/// A heap-allocated semaphore for same-process use (multi-thread backend).
pub struct OwnedSemaphore(Box<Semaphore>);

impl OwnedSemaphore {
    pub fn new() -> Result<Self> {
        let mut boxed = Box::new(Semaphore(unsafe { std::mem::zeroed() }));
        unsafe { boxed.init(false, 0)? };
        Ok(OwnedSemaphore(boxed))
    }

    pub fn post(&self) {
        self.0.post();
    }

    pub fn wait(&self) {
        self.0.wait();
    }
}

impl Drop for OwnedSemaphore {
    fn drop(&mut self) {
        unsafe { self.0.destroy() };
    }
}

unsafe impl Send for OwnedSemaphore {}
unsafe impl Sync for OwnedSemaphore {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = OwnedSemaphore::new().unwrap();
        sem.post();
        sem.wait();
    }

    #[test]
    fn wakes_a_blocked_waiter() {
        let sem = Arc::new(OwnedSemaphore::new().unwrap());
        let waiter = Arc::clone(&sem);
        let handle = std::thread::spawn(move || waiter.wait());

        std::thread::sleep(std::time::Duration::from_millis(20));
        sem.post();
        handle.join().unwrap();
    }
}
