//! Typed stream front-end (§4.7): the producer-facing object that binds
//! configuration, creates named simulators via a per-kind factory, owns a
//! backend, and batches references per guest core before handing them to
//! it.

use parking_lot::Mutex;

use crate::backend::{BackendKind, MultiProcess, MultiThread, SingleThreaded, StreamBackend};
use crate::batcher::Batcher;
use crate::config::StreamConfig;
use crate::constants::{MAX_CPU_CORES, MAX_GPU_CORES};
use crate::error::{Result, VpmuError};
use crate::kinds::{Simulator, SimulatorFactory, StreamKind};
use crate::platform::PlatformInfo;

const NUM_BATCHERS: usize = MAX_CPU_CORES + MAX_GPU_CORES;

struct Inner<K: StreamKind> {
    config: Option<StreamConfig>,
    backend: Option<Box<dyn StreamBackend<K>>>,
    backend_kind: BackendKind,
    ring_capacity: usize,
    platform: PlatformInfo,
}

/// Producer-facing handle for one stream kind. `F` supplies the
/// name→simulator factory (`InstructionFactory`, `CacheFactory`,
/// `BranchFactory`, ...).
///
/// Serialises `bind`/`build`/`destroy`/flush/control-packet issuance behind
/// one front-end mutex (§5, "Front-end mutex serialises ..."); per-core
/// batchers live outside that mutex so sends from distinct cores never
/// contend with each other (§4.2).
pub struct Stream<K: StreamKind, F: SimulatorFactory<K>> {
    inner: Mutex<Inner<K>>,
    batchers: Vec<Batcher<K::Reference>>,
    _factory: std::marker::PhantomData<F>,
}

impl<K: StreamKind, F: SimulatorFactory<K>> Stream<K, F> {
    pub fn new() -> Self {
        Stream {
            inner: Mutex::new(Inner {
                config: None,
                backend: None,
                backend_kind: BackendKind::MultiThread,
                ring_capacity: 4096,
                platform: PlatformInfo::default(),
            }),
            batchers: (0..NUM_BATCHERS).map(|_| Batcher::new()).collect(),
            _factory: std::marker::PhantomData,
        }
    }

    /// Record configuration for the next `build()`. Does not touch any
    /// running backend.
    pub fn bind(&self, config: impl Into<StreamConfig>) {
        self.inner.lock().config = Some(config.into());
    }

    /// Override the backend a subsequent `build()` will use. Defaults to
    /// `MultiThread` for every stream kind (§9 Open Question: the
    /// multi-process backend is heavier to stand up — fork, shared memory,
    /// a heart-beat sidecar — so it is opt-in rather than any kind's
    /// default).
    pub fn set_backend_kind(&self, kind: BackendKind) {
        self.inner.lock().backend_kind = kind;
    }

    pub fn set_ring_capacity(&self, capacity: usize) {
        self.inner.lock().ring_capacity = capacity;
    }

    pub fn set_platform_info(&self, platform: PlatformInfo) {
        self.inner.lock().platform = platform;
    }

    /// Tear down any existing backend, construct one simulator per config
    /// entry via `F::create`, and run them. Returns `Ok(true)` if at least
    /// one simulator was created, `Ok(false)` if the config matched none
    /// (§6: "an empty result list is fatal" at the FFI layer — here it is
    /// surfaced as `Ok(false)` for the caller to treat as fatal itself).
    pub fn build(&self) -> Result<bool> {
        let mut inner = self.inner.lock();

        if inner.backend_kind == BackendKind::MultiProcess && !K::SUPPORTS_MULTI_PROCESS {
            return Err(VpmuError::UnsupportedBackend {
                backend: "multi-process",
                kind: K::NAME,
            });
        }

        if let Some(backend) = inner.backend.as_mut() {
            backend.destroy();
        }

        let entries = inner.config.as_ref().map(StreamConfig::entries).unwrap_or_default();
        let mut workers: Vec<Box<dyn Simulator<K>>> = Vec::with_capacity(entries.len());
        for entry in &entries {
            match F::create(&entry.name) {
                Some(mut sim) => {
                    if let Err(err) = sim.bind(entry) {
                        tracing::error!(simulator = %entry.name, error = %err, "simulator bind failed");
                        continue;
                    }
                    workers.push(sim);
                }
                None => {
                    tracing::warn!(simulator = %entry.name, kind = K::NAME, "simulator not found");
                }
            }
        }

        if workers.is_empty() {
            tracing::warn!(kind = K::NAME, "no simulators matched configuration");
            return Ok(false);
        }

        let ring_capacity = inner.ring_capacity;
        let platform = inner.platform;
        let mut backend: Box<dyn StreamBackend<K>> = match inner.backend_kind {
            BackendKind::SingleThreaded => Box::new(SingleThreaded::new()),
            BackendKind::MultiThread => Box::new(MultiThread::new(ring_capacity)?),
            BackendKind::MultiProcess => Box::new(MultiProcess::new(ring_capacity)?),
        };
        backend.run(workers, platform)?;
        inner.backend = Some(backend);

        tracing::info!(kind = K::NAME, workers = entries.len(), "stream built");
        Ok(true)
    }

    /// Tear down the backend and drop every worker. Idempotent.
    pub fn destroy(&self) {
        if let Some(backend) = self.inner.lock().backend.as_mut() {
            backend.destroy();
        }
    }

    /// Stage `reference` in `core`'s batcher; flush to the backend once
    /// full (§4.2).
    pub fn send_ref(&self, core: u8, reference: K::Reference) {
        let idx = core as usize % NUM_BATCHERS;
        if !self.batchers[idx].push(reference) {
            self.flush_batcher(idx);
            self.batchers[idx].push(reference);
        }
    }

    fn flush_batcher(&self, idx: usize) {
        let inner = self.inner.lock();
        if let Some(backend) = inner.backend.as_ref() {
            self.batchers[idx].flush(|batch| backend.send(batch));
        }
    }

    fn flush_all(&self) {
        for idx in 0..self.batchers.len() {
            self.flush_batcher(idx);
        }
    }

    pub fn reset(&self) {
        self.flush_all();
        if let Some(backend) = self.inner.lock().backend.as_ref() {
            backend.reset();
        }
    }

    /// `BARRIER` / `send_sync` (§4.5): flush, then delegate to the
    /// backend's double-barrier wait.
    pub fn sync(&self) -> Result<()> {
        self.flush_all();
        match self.inner.lock().backend.as_ref() {
            Some(backend) => backend.sync(),
            None => Ok(()),
        }
    }

    pub fn sync_none_blocking(&self) {
        self.flush_all();
        if let Some(backend) = self.inner.lock().backend.as_ref() {
            backend.sync_none_blocking();
        }
    }

    /// `SYNC_DATA` (§4.5): flush, then delegate to the backend's
    /// flag-handshake wait.
    pub fn sync_data(&self) -> Result<()> {
        self.flush_all();
        match self.inner.lock().backend.as_ref() {
            Some(backend) => backend.sync_data(),
            None => Ok(()),
        }
    }

    pub fn dump(&self) -> Result<()> {
        self.flush_all();
        match self.inner.lock().backend.as_ref() {
            Some(backend) => backend.dump(),
            None => Ok(()),
        }
    }

    pub fn get_data(&self, worker_idx: usize) -> Option<K::Data> {
        self.inner.lock().backend.as_ref().and_then(|b| b.get_data(worker_idx))
    }

    pub fn get_model(&self, worker_idx: usize) -> Option<K::Model> {
        self.inner.lock().backend.as_ref().and_then(|b| b.get_model(worker_idx))
    }

    pub fn get_num_workers(&self) -> usize {
        self.inner.lock().backend.as_ref().map_or(0, |b| b.num_workers())
    }
}

impl<K: StreamKind, F: SimulatorFactory<K>> Default for Stream<K, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StreamKind, F: SimulatorFactory<K>> Drop for Stream<K, F> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::instruction::{Instruction, InstructionFactory, Reference, TbCounters};

    fn cfg() -> StreamConfig {
        let mut params = std::collections::BTreeMap::new();
        params.insert("frequency".to_string(), serde_json::json!(1_000_000_000u64));
        StreamConfig::One(crate::config::SimConfig { name: "CortexA9".to_string(), params })
    }

    #[test]
    fn build_with_no_config_returns_false() {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        assert!(!stream.build().unwrap());
    }

    #[test]
    fn unknown_simulator_name_is_skipped_not_fatal() {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        let mut params = std::collections::BTreeMap::new();
        params.insert("frequency".to_string(), serde_json::json!(1u64));
        stream.bind(StreamConfig::One(crate::config::SimConfig {
            name: "NoSuchModel".to_string(),
            params,
        }));
        assert!(!stream.build().unwrap());
    }

    #[test]
    fn end_to_end_send_sync_get_data() {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        stream.bind(cfg());
        stream.set_backend_kind(BackendKind::SingleThreaded);
        assert!(stream.build().unwrap());

        let tb = TbCounters { total: 4, load: 1, store: 1, has_branch: 0, ticks: 10 };
        for _ in 0..3 {
            stream.send_ref(0, Reference::data(0, 0x10, &tb as *const _));
        }
        stream.sync().unwrap();

        let data = stream.get_data(0).unwrap();
        assert_eq!(data.user.total_inst, 12);
        assert_eq!(stream.get_num_workers(), 1);
    }

    #[test]
    fn multi_process_rejected_for_instruction_kind() {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        stream.bind(cfg());
        stream.set_backend_kind(BackendKind::MultiProcess);
        assert!(matches!(stream.build(), Err(VpmuError::UnsupportedBackend { .. })));
    }

    #[test]
    fn destroy_then_build_again_is_clean() {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        stream.bind(cfg());
        stream.set_backend_kind(BackendKind::SingleThreaded);
        assert!(stream.build().unwrap());
        stream.destroy();
        assert!(stream.build().unwrap());
        assert_eq!(stream.get_num_workers(), 1);
    }
}
