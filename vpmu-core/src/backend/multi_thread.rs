//! Multi-thread backend (§4.4.2): ring and control block live in
//! process-local memory; each simulator runs on its own thread, woken by a
//! counting semaphore after every batch push.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{dispatch, StreamBackend};
use crate::constants::{SYNC_PERIOD, SYNC_TIMEOUT_MS, WORKER_POP_BUFFER_SIZE};
use crate::error::{Result, VpmuError};
use crate::kinds::{Packet, PacketType, Simulator, StreamKind};
use crate::platform::PlatformInfo;
use crate::ring::{LocalRing, Ring};
use crate::sem::OwnedSemaphore;

struct ControlSlot<K: StreamKind> {
    model: Mutex<K::Model>,
    data: Mutex<K::Data>,
    synced_flag: AtomicBool,
    sync_counter: AtomicU32,
}

impl<K: StreamKind> ControlSlot<K> {
    fn new() -> Self {
        ControlSlot {
            model: Mutex::new(K::Model::default()),
            data: Mutex::new(K::Data::default()),
            synced_flag: AtomicBool::new(false),
            sync_counter: AtomicU32::new(0),
        }
    }
}

pub struct MultiThread<K: StreamKind> {
    capacity: usize,
    ring: Arc<LocalRing<K::Reference>>,
    sems: Vec<Arc<OwnedSemaphore>>,
    slots: Vec<Arc<ControlSlot<K>>>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    token: Arc<AtomicU32>,
    sends_since_barrier: AtomicU32,
}

impl<K: StreamKind> MultiThread<K> {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(MultiThread {
            capacity,
            ring: Arc::new(LocalRing::new(capacity)?),
            sems: Vec::new(),
            slots: Vec::new(),
            handles: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            token: Arc::new(AtomicU32::new(0)),
            sends_since_barrier: AtomicU32::new(0),
        })
    }

    fn wait_for_build_readiness(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if self.slots.iter().all(|s| s.synced_flag.load(Ordering::Acquire)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let dead = self
                    .slots
                    .iter()
                    .position(|s| !s.synced_flag.load(Ordering::Acquire))
                    .unwrap_or(0);
                return Err(VpmuError::WorkerDown { id: dead });
            }
            std::thread::yield_now();
        }
    }

    fn wait_ring_empty(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if (0..self.slots.len()).all(|id| self.ring.empty(id)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VpmuError::Timeout {
                    what: "ring to drain on all readers".to_string(),
                    millis: SYNC_TIMEOUT_MS,
                });
            }
            std::thread::yield_now();
        }
    }

    fn post_all(&self) {
        for sem in &self.sems {
            sem.post();
        }
    }
}

fn worker_loop<K: StreamKind>(
    id: usize,
    mut sim: Box<dyn Simulator<K>>,
    ring: Arc<LocalRing<K::Reference>>,
    sem: Arc<OwnedSemaphore>,
    slot: Arc<ControlSlot<K>>,
    cancel: Arc<AtomicBool>,
    token: Arc<AtomicU32>,
    platform: PlatformInfo,
) {
    sim.set_platform_info(platform);
    {
        let mut model = slot.model.lock();
        if let Err(err) = sim.build(&mut model) {
            tracing::error!(worker = id, error = %err, "simulator build failed");
            return;
        }
    }
    slot.synced_flag.store(true, Ordering::Release);

    let fill = K::Reference::control(PacketType::Reset);
    let mut buf = vec![fill; WORKER_POP_BUFFER_SIZE];

    loop {
        sem.wait();
        if cancel.load(Ordering::Acquire) {
            return;
        }
        loop {
            let n = ring.pop(id, &mut buf);
            if n == 0 {
                break;
            }
            for reference in &buf[..n] {
                match reference.packet_type() {
                    PacketType::DumpInfo => {
                        while token.load(Ordering::Acquire) != id as u32 {
                            if cancel.load(Ordering::Acquire) {
                                return;
                            }
                            std::thread::yield_now();
                        }
                        let mut data = slot.data.lock();
                        sim.dump(id, &data);
                        token.store(id as u32 + 1, Ordering::Release);
                    }
                    PacketType::SyncData => {
                        while slot.synced_flag.load(Ordering::Acquire) {
                            if cancel.load(Ordering::Acquire) {
                                return;
                            }
                            std::thread::yield_now();
                        }
                        slot.sync_counter.fetch_add(1, Ordering::AcqRel);
                        let mut data = slot.data.lock();
                        dispatch(sim.as_mut(), id, reference, &mut data);
                        drop(data);
                        slot.synced_flag.store(true, Ordering::Release);
                    }
                    _ => {
                        let mut data = slot.data.lock();
                        dispatch(sim.as_mut(), id, reference, &mut data);
                    }
                }
            }
        }
    }
}

impl<K: StreamKind> StreamBackend<K> for MultiThread<K> {
    fn run(&mut self, workers: Vec<Box<dyn Simulator<K>>>, platform: PlatformInfo) -> Result<()> {
        self.destroy();

        for sim in workers {
            let id = self.ring.register_reader();
            let slot = Arc::new(ControlSlot::new());
            let sem = Arc::new(OwnedSemaphore::new()?);

            let ring = Arc::clone(&self.ring);
            let cancel = Arc::clone(&self.cancel);
            let token = Arc::clone(&self.token);
            let thread_slot = Arc::clone(&slot);
            let thread_sem = Arc::clone(&sem);

            let handle = std::thread::Builder::new()
                .name(format!("vpmu-{}-w{id}", K::NAME))
                .spawn(move || {
                    worker_loop(id, sim, ring, thread_sem, thread_slot, cancel, token, platform)
                })
                .map_err(VpmuError::Io)?;

            self.sems.push(sem);
            self.slots.push(slot);
            self.handles.push(handle);
        }

        self.wait_for_build_readiness()
    }

    fn send(&self, refs: &[K::Reference]) {
        self.ring.push(refs);
        self.post_all();

        let count = self.sends_since_barrier.fetch_add(1, Ordering::AcqRel) + 1;
        if count % SYNC_PERIOD == 0 {
            self.ring.push(&[K::Reference::control(PacketType::Barrier)]);
            self.post_all();
        }
    }

    fn reset(&self) {
        self.ring.push(&[K::Reference::control(PacketType::Reset)]);
        self.post_all();
    }

    fn sync(&self) -> Result<()> {
        self.ring.push(&[K::Reference::control(PacketType::Barrier)]);
        self.post_all();
        self.wait_ring_empty()?;

        self.ring.push(&[K::Reference::control(PacketType::Barrier)]);
        self.post_all();
        self.wait_ring_empty()
    }

    fn sync_none_blocking(&self) {
        self.ring.push(&[K::Reference::control(PacketType::Barrier)]);
        self.post_all();
    }

    fn sync_data(&self) -> Result<()> {
        for slot in &self.slots {
            slot.synced_flag.store(false, Ordering::Release);
        }
        self.ring.push(&[K::Reference::control(PacketType::SyncData)]);
        self.post_all();

        let deadline = Instant::now() + Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if self.slots.iter().all(|s| s.synced_flag.load(Ordering::Acquire)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let dead = self
                    .slots
                    .iter()
                    .position(|s| !s.synced_flag.load(Ordering::Acquire))
                    .unwrap_or(0);
                return Err(VpmuError::WorkerDown { id: dead });
            }
            std::thread::yield_now();
        }
    }

    fn dump(&self) -> Result<()> {
        self.token.store(0, Ordering::Release);
        self.ring.push(&[K::Reference::control(PacketType::DumpInfo)]);
        self.post_all();

        let deadline = Instant::now() + Duration::from_millis(SYNC_TIMEOUT_MS);
        loop {
            if self.token.load(Ordering::Acquire) as usize >= self.slots.len() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VpmuError::Timeout {
                    what: "dump serialization".to_string(),
                    millis: SYNC_TIMEOUT_MS,
                });
            }
            std::thread::yield_now();
        }
    }

    fn get_data(&self, worker_idx: usize) -> Option<K::Data> {
        self.slots.get(worker_idx).map(|s| s.data.lock().clone())
    }

    fn get_model(&self, worker_idx: usize) -> Option<K::Model> {
        self.slots.get(worker_idx).map(|s| s.model.lock().clone())
    }

    fn num_workers(&self) -> usize {
        self.slots.len()
    }

    fn destroy(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.post_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.sems.clear();
        self.slots.clear();
        self.token.store(0, Ordering::Release);
        self.sends_since_barrier.store(0, Ordering::Release);
        self.ring = Arc::new(LocalRing::new(self.capacity).expect("capacity validated in new()"));
        self.cancel.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::instruction::{CortexA9, Instruction, Reference, TbCounters};

    fn platform() -> PlatformInfo {
        PlatformInfo { cpu_cores: 1, gpu_cores: 0, cpu_frequency_hz: 1_000_000_000 }
    }

    #[test]
    fn worker_processes_data_then_syncs() {
        let mut backend: MultiThread<Instruction> = MultiThread::new(64).unwrap();
        backend.run(vec![Box::new(CortexA9::new())], platform()).unwrap();

        let tb = TbCounters { total: 10, load: 3, store: 2, has_branch: 1, ticks: 12 };
        for _ in 0..3 {
            backend.send(&[Reference::data(0, 0x10, &tb as *const _)]);
        }
        backend.sync().unwrap();

        let data = backend.get_data(0).unwrap();
        assert_eq!(data.user.total_inst, 30);
        assert_eq!(data.cycles[0], 36);

        backend.destroy();
    }

    #[test]
    fn dump_serializes_in_worker_id_order() {
        let mut backend: MultiThread<Instruction> = MultiThread::new(64).unwrap();
        backend
            .run(vec![Box::new(CortexA9::new()), Box::new(CortexA9::new())], platform())
            .unwrap();

        backend.dump().unwrap();
        backend.destroy();
    }

    #[test]
    fn sync_data_increments_sync_counter_once_per_round() {
        let mut backend: MultiThread<Instruction> = MultiThread::new(64).unwrap();
        backend.run(vec![Box::new(CortexA9::new())], platform()).unwrap();

        backend.sync_data().unwrap();
        backend.sync_data().unwrap();
        assert_eq!(backend.slots[0].sync_counter.load(Ordering::Acquire), 2);

        backend.destroy();
    }

    #[test]
    fn rebuild_resets_ring_registration() {
        let mut backend: MultiThread<Instruction> = MultiThread::new(64).unwrap();
        backend.run(vec![Box::new(CortexA9::new())], platform()).unwrap();
        backend.destroy();
        backend.run(vec![Box::new(CortexA9::new())], platform()).unwrap();
        assert_eq!(backend.num_workers(), 1);
        backend.destroy();
    }
}
