//! Heart-beat liveness supervision for the multi-process backend (§4.6).
//!
//! Two halves run in two different processes: the producer ticks a shared
//! counter every 100 ms; a forked sidecar samples it every 500 ms and, if it
//! ever finds the counter unchanged AND the producer process gone
//! (`kill(pid, 0)` returns `ESRCH`), tears down the shared region, SIGKILLs
//! every worker, and aborts itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::constants::{HEARTBEAT_POLL, HEARTBEAT_TICK};

/// Spawn the producer-side ticker thread. Returns a handle whose `Drop`
/// stops the thread (used when the stream is torn down normally).
///
/// `heart_beat` must outlive the returned handle — for the multi-process
/// backend that means the shared-memory region it points into must not be
/// unmapped before `TickerHandle` is dropped.
pub fn spawn_ticker(heart_beat: &'static AtomicU64) -> TickerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let join = std::thread::Builder::new()
        .name("vpmu-heartbeat".to_string())
        .spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                std::thread::sleep(HEARTBEAT_TICK);
                heart_beat.fetch_add(1, Ordering::Relaxed);
            }
        })
        .expect("spawning the heart-beat ticker thread");

    TickerHandle { stop, join: Some(join) }
}

pub struct TickerHandle {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Run the zombie-killer loop. Called from within the forked sidecar
/// process; never returns under normal operation.
///
/// `on_producer_dead` tears down shared resources and SIGKILLs every
/// worker; it is called at most once, immediately before this function
/// aborts the process.
pub fn run_zombie_killer(
    parent_pid: Pid,
    heart_beat: &AtomicU64,
    worker_pids: &[Pid],
    on_producer_dead: impl FnOnce(),
) -> ! {
    let mut last_seen = heart_beat.load(Ordering::Relaxed);
    let mut warned_stopped = false;

    loop {
        std::thread::sleep(HEARTBEAT_POLL);
        let current = heart_beat.load(Ordering::Relaxed);

        if current == last_seen {
            match signal::kill(parent_pid, None) {
                Err(nix::errno::Errno::ESRCH) => {
                    tracing::error!("producer stopped beating and is gone; killing workers");
                    on_producer_dead();
                    for pid in worker_pids {
                        let _ = signal::kill(*pid, Signal::SIGKILL);
                    }
                    std::process::abort();
                }
                _ => {
                    if !warned_stopped {
                        tracing::debug!(
                            "producer stopped beating but is still alive (stopped under a debugger?)"
                        );
                        warned_stopped = true;
                    }
                }
            }
        }
        last_seen = current;
    }
}
