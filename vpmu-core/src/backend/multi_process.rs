//! Multi-process backend (§4.4.3): ring and per-worker control state live
//! in named, `mmap`'d shared memory; each simulator runs in its own forked
//! child. A zombie-killer sidecar (§4.6) guarantees workers don't outlive a
//! crashed producer.
//!
//! Only usable for kinds whose `Data`/`Model` are plain-old-data
//! (`Copy`) — a kind whose packet carries a pointer into producer-owned
//! memory (the instruction stream) can never be placed in a forked
//! child's address space, which is exactly what
//! `StreamKind::SUPPORTS_MULTI_PROCESS` flags (§9 design notes).

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nix::sys::signal::{self, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use super::heartbeat::{self, TickerHandle};
use super::{dispatch, StreamBackend};
use crate::constants::{MAX_WORKERS, SYNC_PERIOD, SYNC_TIMEOUT_MS};
use crate::error::{Result, VpmuError};
use crate::kinds::{Packet, PacketType, Simulator, StreamKind};
use crate::platform::PlatformInfo;
use crate::ring::shared::SharedRing;
use crate::ring::Ring;
use crate::sem::Semaphore;

#[repr(C)]
struct ProcessHeader {
    magic: u64,
    platform: PlatformInfo,
    token: AtomicU32,
    heart_beat: AtomicU64,
    num_workers: AtomicU32,
}

const PROCESS_MAGIC: u64 = 0x5650_4d55_4d50_5243; // "VPMUMPRC"

#[repr(C)]
struct StreamCommon<D: Copy, M: Copy> {
    sem: Semaphore,
    model: M,
    data: D,
    sync_counter: AtomicU32,
    synced_flag: AtomicU32,
}

/// Layout of the control shared-memory segment: a header followed by one
/// `StreamCommon` slot per potential worker.
#[repr(C)]
struct ControlLayout<D: Copy, M: Copy> {
    header: ProcessHeader,
    slots: [StreamCommon<D, M>; MAX_WORKERS],
}

struct ControlRegion<D: Copy, M: Copy> {
    ptr: *mut u8,
    len: usize,
    path: std::path::PathBuf,
    _phantom: std::marker::PhantomData<(D, M)>,
}

impl<D: Copy, M: Copy> ControlRegion<D, M> {
    fn create(path: &std::path::Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let len = std::mem::size_of::<ControlLayout<D, M>>();

        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(len as u64)?;

        let ptr = unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            );
            if p == libc::MAP_FAILED {
                return Err(VpmuError::Io(std::io::Error::last_os_error()));
            }
            p as *mut u8
        };

        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        let layout = unsafe { &mut *(ptr as *mut ControlLayout<D, M>) };
        layout.header.magic = PROCESS_MAGIC;

        Ok(ControlRegion { ptr, len, path: path.to_path_buf(), _phantom: std::marker::PhantomData })
    }

    fn layout(&self) -> &ControlLayout<D, M> {
        unsafe { &*(self.ptr as *const ControlLayout<D, M>) }
    }
}

impl<D: Copy, M: Copy> Drop for ControlRegion<D, M> {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut _, self.len) };
        let _ = std::fs::remove_file(&self.path);
    }
}

unsafe impl<D: Copy + Send, M: Copy + Send> Send for ControlRegion<D, M> {}
unsafe impl<D: Copy + Send, M: Copy + Send> Sync for ControlRegion<D, M> {}

pub struct MultiProcess<K: StreamKind>
where
    K::Data: Copy,
    K::Model: Copy,
{
    capacity: usize,
    control: Option<ControlRegion<K::Data, K::Model>>,
    ring: Option<SharedRing<K::Reference>>,
    worker_pids: Vec<Pid>,
    zombie_killer_pid: Option<Pid>,
    ticker: Option<TickerHandle>,
    num_workers: usize,
    sends_since_barrier: AtomicU32,
    instance: u64,
}

impl<K: StreamKind> MultiProcess<K>
where
    K::Data: Copy,
    K::Model: Copy,
{
    pub fn new(capacity: usize) -> Result<Self> {
        if !K::SUPPORTS_MULTI_PROCESS {
            return Err(VpmuError::UnsupportedBackend { backend: "multi-process", kind: K::NAME });
        }
        static NEXT_INSTANCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        Ok(MultiProcess {
            capacity,
            control: None,
            ring: None,
            worker_pids: Vec::new(),
            zombie_killer_pid: None,
            ticker: None,
            num_workers: 0,
            sends_since_barrier: AtomicU32::new(0),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn control_path(&self) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "vpmu_{}_control_{}_{}",
            K::NAME,
            std::process::id(),
            self.instance
        ))
    }

    fn ring_path(&self) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "vpmu_{}_ring_buffer_{}_{}",
            K::NAME,
            std::process::id(),
            self.instance
        ))
    }

    fn control(&self) -> &ControlRegion<K::Data, K::Model> {
        self.control.as_ref().expect("multi-process backend not built")
    }

    fn ring(&self) -> &SharedRing<K::Reference> {
        self.ring.as_ref().expect("multi-process backend not built")
    }

    fn post_all(&self) {
        let layout = self.control().layout();
        for slot in &layout.slots[..self.num_workers] {
            slot.sem.post();
        }
    }
}

impl<K: StreamKind> StreamBackend<K> for MultiProcess<K>
where
    K::Data: Copy,
    K::Model: Copy,
{
    fn run(&mut self, workers: Vec<Box<dyn Simulator<K>>>, platform: PlatformInfo) -> Result<()> {
        self.destroy();

        let control_path = self.control_path();
        let ring_path = self.ring_path();

        let control = ControlRegion::<K::Data, K::Model>::create(&control_path)?;
        let ring = SharedRing::<K::Reference>::create(&ring_path, self.capacity)?;

        self.num_workers = workers.len();

        {
            let layout = control.layout();
            unsafe {
                let header = &layout.header as *const ProcessHeader as *mut ProcessHeader;
                (*header).platform = platform;
            }
            layout.header.num_workers.store(self.num_workers as u32, Ordering::Release);
        }

        for (id, mut sim) in workers.into_iter().enumerate() {
            ring.register_reader();

            // Safety: between fork() and exec()-free continuation, the
            // child only touches async-signal-safe APIs and the already
            // mapped shared regions below until it calls `abort()`.
            match unsafe { fork() }.map_err(VpmuError::System)? {
                ForkResult::Parent { child } => {
                    self.worker_pids.push(child);
                }
                ForkResult::Child => {
                    // Catch panics rather than let them unwind into the
                    // parent's copy of `control`/`ring` and run their
                    // destructors (munmap + delete) underneath the parent.
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        run_worker(id, sim.as_mut(), &ring, &control, platform);
                    }));
                    std::process::abort();
                }
            }
        }

        self.control = Some(control);
        self.ring = Some(ring);

        self.spawn_zombie_killer()?;
        self.wait_for_build_readiness()
    }

    fn send(&self, refs: &[K::Reference]) {
        self.ring().push(refs);
        self.post_all();

        let count = self.sends_since_barrier.fetch_add(1, Ordering::AcqRel) + 1;
        if count % SYNC_PERIOD == 0 {
            self.ring().push(&[K::Reference::control(PacketType::Barrier)]);
            self.post_all();
        }
    }

    fn reset(&self) {
        self.ring().push(&[K::Reference::control(PacketType::Reset)]);
        self.post_all();
    }

    fn sync(&self) -> Result<()> {
        self.ring().push(&[K::Reference::control(PacketType::Barrier)]);
        self.post_all();
        self.wait_ring_empty()?;
        self.ring().push(&[K::Reference::control(PacketType::Barrier)]);
        self.post_all();
        self.wait_ring_empty()
    }

    fn sync_none_blocking(&self) {
        self.ring().push(&[K::Reference::control(PacketType::Barrier)]);
        self.post_all();
    }

    fn sync_data(&self) -> Result<()> {
        let layout = self.control().layout();
        for slot in &layout.slots[..self.num_workers] {
            slot.synced_flag.store(0, Ordering::Release);
        }
        self.ring().push(&[K::Reference::control(PacketType::SyncData)]);
        self.post_all();

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if layout.slots[..self.num_workers]
                .iter()
                .all(|s| s.synced_flag.load(Ordering::Acquire) != 0)
            {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                let dead = layout.slots[..self.num_workers]
                    .iter()
                    .position(|s| s.synced_flag.load(Ordering::Acquire) == 0)
                    .unwrap_or(0);
                return Err(VpmuError::WorkerDown { id: dead });
            }
            std::thread::yield_now();
        }
    }

    fn dump(&self) -> Result<()> {
        let layout = self.control().layout();
        layout.header.token.store(0, Ordering::Release);
        self.ring().push(&[K::Reference::control(PacketType::DumpInfo)]);
        self.post_all();

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if layout.header.token.load(Ordering::Acquire) as usize >= self.num_workers {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(VpmuError::Timeout {
                    what: "dump serialization".to_string(),
                    millis: SYNC_TIMEOUT_MS,
                });
            }
            std::thread::yield_now();
        }
    }

    fn get_data(&self, worker_idx: usize) -> Option<K::Data> {
        if worker_idx >= self.num_workers {
            return None;
        }
        Some(self.control().layout().slots[worker_idx].data)
    }

    fn get_model(&self, worker_idx: usize) -> Option<K::Model> {
        if worker_idx >= self.num_workers {
            return None;
        }
        Some(self.control().layout().slots[worker_idx].model)
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn destroy(&mut self) {
        self.ticker = None; // stops the heart-beat ticker thread

        for pid in self.worker_pids.drain(..) {
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
        if let Some(pid) = self.zombie_killer_pid.take() {
            let _ = signal::kill(pid, Signal::SIGKILL);
        }

        self.control = None;
        self.ring = None;
        self.num_workers = 0;
        self.sends_since_barrier.store(0, Ordering::Release);
    }
}

impl<K: StreamKind> MultiProcess<K>
where
    K::Data: Copy,
    K::Model: Copy,
{
    fn wait_for_build_readiness(&self) -> Result<()> {
        let layout = self.control().layout();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if layout.slots[..self.num_workers]
                .iter()
                .all(|s| s.synced_flag.load(Ordering::Acquire) != 0)
            {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                let dead = layout.slots[..self.num_workers]
                    .iter()
                    .position(|s| s.synced_flag.load(Ordering::Acquire) == 0)
                    .unwrap_or(0);
                return Err(VpmuError::WorkerDown { id: dead });
            }
            std::thread::yield_now();
        }
    }

    fn wait_ring_empty(&self) -> Result<()> {
        let ring = self.ring();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if (0..self.num_workers).all(|id| ring.empty(id)) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(VpmuError::Timeout {
                    what: "shared ring to drain on all readers".to_string(),
                    millis: SYNC_TIMEOUT_MS,
                });
            }
            std::thread::yield_now();
        }
    }

    fn spawn_zombie_killer(&mut self) -> Result<()> {
        let parent_pid = nix::unistd::getpid();
        let layout_ptr = self.control().ptr as usize;
        let worker_pids = self.worker_pids.clone();
        let control_path = self.control_path();
        let ring_path = self.ring_path();

        match unsafe { fork() }.map_err(VpmuError::System)? {
            ForkResult::Parent { child } => {
                self.zombie_killer_pid = Some(child);
                // Safety: the mapping outlives the ticker thread — `destroy`
                // drops `self.ticker` (joining it) before unmapping `self.control`.
                let heart_beat: &'static AtomicU64 = unsafe {
                    let header = &*(layout_ptr as *const ProcessHeader);
                    std::mem::transmute::<&AtomicU64, &'static AtomicU64>(&header.heart_beat)
                };
                self.ticker = Some(heartbeat::spawn_ticker(heart_beat));
                Ok(())
            }
            ForkResult::Child => {
                name_process(&format!("vpmu-{}-zk", K::NAME));
                let header = unsafe { &*(layout_ptr as *const ProcessHeader) };
                heartbeat::run_zombie_killer(parent_pid, &header.heart_beat, &worker_pids, || {
                    let _ = std::fs::remove_file(&control_path);
                    let _ = std::fs::remove_file(&ring_path);
                });
            }
        }
    }
}

/// Set this process's `comm` name for debuggability (`ps`, `/proc/<pid>/comm`),
/// mirroring the original collaborator's `name_process` helper (§7.5). Linux
/// truncates at 15 bytes; best-effort, failures are not fatal.
#[cfg(target_os = "linux")]
fn name_process(name: &str) {
    if let Ok(c_name) = std::ffi::CString::new(name) {
        unsafe { libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    }
}

#[cfg(not(target_os = "linux"))]
fn name_process(_name: &str) {}

fn run_worker<K: StreamKind>(
    id: usize,
    sim: &mut dyn Simulator<K>,
    ring: &SharedRing<K::Reference>,
    control: &ControlRegion<K::Data, K::Model>,
    platform: PlatformInfo,
) -> !
where
    K::Data: Copy,
    K::Model: Copy,
{
    name_process(&format!("vpmu-{}-w{id}", K::NAME));
    sim.set_platform_info(platform);

    let layout = control.layout();
    let slot = &layout.slots[id];
    let slot_mut = unsafe { &mut *(slot as *const StreamCommon<K::Data, K::Model> as *mut StreamCommon<K::Data, K::Model>) };

    unsafe {
        if slot_mut.sem.init(true, 0).is_err() {
            std::process::abort();
        }
    }

    if sim.build(&mut slot_mut.model).is_err() {
        std::process::abort();
    }
    slot_mut.synced_flag.store(1, Ordering::Release);

    let mut buf = vec![K::Reference::control(PacketType::Reset); crate::constants::WORKER_POP_BUFFER_SIZE];
    loop {
        slot.sem.wait();
        loop {
            let n = ring.pop(id, &mut buf);
            if n == 0 {
                break;
            }
            for reference in &buf[..n] {
                match reference.packet_type() {
                    PacketType::DumpInfo => {
                        while layout.header.token.load(Ordering::Acquire) != id as u32 {
                            std::thread::yield_now();
                        }
                        sim.dump(id, &slot_mut.data);
                        layout.header.token.store(id as u32 + 1, Ordering::Release);
                    }
                    PacketType::SyncData => {
                        while slot.synced_flag.load(Ordering::Acquire) != 0 {
                            std::thread::yield_now();
                        }
                        slot_mut.sync_counter.fetch_add(1, Ordering::AcqRel);
                        dispatch(sim, id, reference, &mut slot_mut.data);
                        slot_mut.synced_flag.store(1, Ordering::Release);
                    }
                    _ => dispatch(sim, id, reference, &mut slot_mut.data),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::kinds::cache::{Cache, DirectMapped, Reference as CacheReference, PROCESSOR_CPU};
    use crate::kinds::instruction::Instruction;

    fn platform() -> PlatformInfo {
        PlatformInfo { cpu_cores: 1, gpu_cores: 0, cpu_frequency_hz: 1_000_000_000 }
    }

    #[test]
    fn rejects_kind_without_multi_process_support() {
        let result = MultiProcess::<Instruction>::new(64);
        assert!(matches!(result, Err(VpmuError::UnsupportedBackend { .. })));
    }

    #[test]
    fn fork_send_sync_destroy_round_trip() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();

        let mut backend: MultiProcess<Cache> = MultiProcess::new(64).unwrap();
        backend.run(vec![Box::new(sim)], platform()).unwrap();
        assert_eq!(backend.num_workers(), 1);

        for addr in [0x1000u64, 0x1000, 0x2000] {
            backend.send(&[CacheReference::load(0, PROCESSOR_CPU, addr, 8)]);
        }
        backend.sync().unwrap();

        let data = backend.get_data(0).unwrap();
        assert_eq!(data.memory_accesses, 2);

        backend.destroy();
        assert!(backend.get_data(0).is_none());
    }

    #[test]
    fn sync_data_increments_sync_counter_once_per_round() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();

        let mut backend: MultiProcess<Cache> = MultiProcess::new(64).unwrap();
        backend.run(vec![Box::new(sim)], platform()).unwrap();

        backend.sync_data().unwrap();
        backend.sync_data().unwrap();
        let counter = backend.control().layout().slots[0].sync_counter.load(Ordering::Acquire);
        assert_eq!(counter, 2);

        backend.destroy();
    }

    #[test]
    fn dump_does_not_hang_with_single_worker() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();

        let mut backend: MultiProcess<Cache> = MultiProcess::new(64).unwrap();
        backend.run(vec![Box::new(sim)], platform()).unwrap();
        backend.dump().unwrap();
        backend.destroy();
    }
}
