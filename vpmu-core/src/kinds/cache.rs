//! Cache stream: per-processor, per-level, per-core hit/miss accounting
//! driven by guest load/store addresses.
//!
//! Unlike the instruction stream, a cache `Reference` carries only an
//! address and a size — no pointer into producer-owned memory — so this
//! kind may run behind the multi-process backend.

use crate::config::SimConfig;
use crate::constants::MAX_CPU_CORES;
use crate::error::{Result, VpmuError};
use crate::platform::PlatformInfo;

use super::{ModelName, Packet, PacketType, Simulator, StreamKind, SimulatorFactory};

pub const NUM_PROCESSORS: usize = 2; // CPU, GPU
pub const PROCESSOR_CPU: u8 = 0;
pub const PROCESSOR_GPU: u8 = 1;

pub const NUM_LEVELS: usize = 4; // L1, L2, L3, Memory
pub const LEVEL_L1: usize = 0;
pub const LEVEL_MEMORY: usize = 3;

pub const NUM_INDEX: usize = 4;
pub const READ: usize = 0;
pub const WRITE: usize = 1;
pub const READ_MISS: usize = 2;
pub const WRITE_MISS: usize = 3;

/// Read/write/fetch access-kind bits packed into the high byte of `ty`,
/// alongside the low byte's `PacketType` discriminant — the same bitmask
/// style the original collaborator uses to fold `VPMU_PACKET_HOT` into a
/// data packet's `type` field rather than add a separate struct member.
const ACCESS_WRITE: u16 = 0x0100;
const ACCESS_FETCH: u16 = 0x0200;

/// One cache access event or control command, matching the original's
/// six-field wire layout exactly (§4.2): no room for a per-access flag, so
/// read/write/fetch is packed into `ty`'s high byte instead.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Reference {
    pub ty: u16,
    pub num_ex_slots: u8,
    pub core: u8,
    pub processor: u8,
    pub addr: u64,
    pub size: u16,
}

impl Reference {
    fn base_type(&self) -> PacketType {
        match self.ty & 0x00ff {
            0 => PacketType::Data,
            1 => PacketType::Hot,
            2 => PacketType::Barrier,
            3 => PacketType::Reset,
            4 => PacketType::DumpInfo,
            5 => PacketType::SyncData,
            _ => PacketType::Data,
        }
    }

    pub fn is_write(&self) -> bool {
        self.ty & ACCESS_WRITE != 0
    }

    pub fn is_fetch(&self) -> bool {
        self.ty & ACCESS_FETCH != 0
    }
}

impl Packet for Reference {
    fn packet_type(&self) -> PacketType {
        self.base_type()
    }

    fn core(&self) -> u8 {
        self.core
    }

    fn control(ty: PacketType) -> Self {
        Reference { ty: ty as u16, num_ex_slots: 0, core: 0, processor: PROCESSOR_CPU, addr: 0, size: 0 }
    }
}

impl Reference {
    pub fn load(core: u8, processor: u8, addr: u64, size: u16) -> Self {
        Reference { ty: PacketType::Data as u16, num_ex_slots: 0, core, processor, addr, size }
    }

    pub fn store(core: u8, processor: u8, addr: u64, size: u16) -> Self {
        Reference { ty: PacketType::Data as u16 | ACCESS_WRITE, ..Reference::load(core, processor, addr, size) }
    }

    pub fn fetch(core: u8, processor: u8, addr: u64, size: u16) -> Self {
        Reference { ty: PacketType::Data as u16 | ACCESS_FETCH, ..Reference::load(core, processor, addr, size) }
    }
}

type Counters = [[[[u64; NUM_INDEX]; MAX_CPU_CORES]; NUM_LEVELS]; NUM_PROCESSORS];

/// Aggregated counters for one cache-stream worker.
#[derive(Debug, Clone, Copy)]
pub struct Data {
    pub insn_cache: Counters,
    pub data_cache: Counters,
    pub memory_accesses: u64,
    pub memory_time_ns: u64,
    pub io_memory_time_ns: u64,
}

impl Default for Data {
    fn default() -> Self {
        Data {
            insn_cache: [[[[0; NUM_INDEX]; MAX_CPU_CORES]; NUM_LEVELS]; NUM_PROCESSORS],
            data_cache: [[[[0; NUM_INDEX]; MAX_CPU_CORES]; NUM_LEVELS]; NUM_PROCESSORS],
            memory_accesses: 0,
            memory_time_ns: 0,
            io_memory_time_ns: 0,
        }
    }
}

impl Data {
    pub fn memory_cycles(&self, processor: usize) -> u64 {
        self.insn_cache[processor][LEVEL_MEMORY]
            .iter()
            .map(|c| c[READ] + c[WRITE])
            .sum::<u64>()
            + self.data_cache[processor][LEVEL_MEMORY].iter().map(|c| c[READ] + c[WRITE]).sum::<u64>()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Model {
    pub name: ModelName,
    pub levels: u32,
    pub latency: [u32; NUM_LEVELS],
    pub d_log2_blocksize: [u32; NUM_LEVELS],
    pub d_write_alloc: [bool; NUM_LEVELS],
    pub d_write_back: [bool; NUM_LEVELS],
}

pub struct Cache;

impl StreamKind for Cache {
    type Reference = Reference;
    type Data = Data;
    type Model = Model;

    const NAME: &'static str = "cache";
    const SUPPORTS_MULTI_PROCESS: bool = true;
}

/// Direct-mapped single-level (L1) cache model: one tag per set per core,
/// no-write-allocate optional per config. Misses fall straight through to
/// `LEVEL_MEMORY`, charged the configured memory latency.
pub struct DirectMapped {
    model: Model,
    sets_log2: u32,
    tags: Vec<[u64; MAX_CPU_CORES]>,
}

impl DirectMapped {
    pub fn new() -> Self {
        DirectMapped { model: Model::default(), sets_log2: 10, tags: Vec::new() }
    }

    fn line_bits(&self) -> u32 {
        self.model.d_log2_blocksize[LEVEL_L1].max(1)
    }

    fn classify(&mut self, addr: u64, core: usize) -> bool {
        let line = addr >> self.line_bits();
        let set = (line as usize) & ((1usize << self.sets_log2) - 1);
        let tag = line >> self.sets_log2;
        let slot = &mut self.tags[set][core];
        let hit = *slot == tag + 1;
        *slot = tag + 1;
        hit
    }
}

impl Default for DirectMapped {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator<Cache> for DirectMapped {
    fn name(&self) -> &'static str {
        "DirectMapped"
    }

    fn bind(&mut self, config: &SimConfig) -> Result<()> {
        self.model.name =
            config.get::<String>("name").as_deref().unwrap_or("DirectMapped").into();
        self.model.levels = config.get::<u32>("levels").unwrap_or(1);
        if let Some(latency) = config.get::<Vec<u32>>("latency") {
            for (i, v) in latency.into_iter().take(NUM_LEVELS).enumerate() {
                self.model.latency[i] = v;
            }
        } else {
            self.model.latency[LEVEL_MEMORY] = 100;
        }
        if let Some(bs) = config.get::<Vec<u32>>("d_log2_blocksize") {
            for (i, v) in bs.into_iter().take(NUM_LEVELS).enumerate() {
                self.model.d_log2_blocksize[i] = v;
            }
        } else {
            self.model.d_log2_blocksize[LEVEL_L1] = 6; // 64-byte lines
        }
        if self.model.d_log2_blocksize[LEVEL_L1] == 0 {
            return Err(VpmuError::config("DirectMapped: d_log2_blocksize[L1] must be > 0"));
        }
        self.sets_log2 = 10;
        Ok(())
    }

    fn build(&mut self, model: &mut Model) -> Result<()> {
        self.tags = vec![[0u64; MAX_CPU_CORES]; 1usize << self.sets_log2];
        *model = self.model.clone();
        Ok(())
    }

    fn set_platform_info(&mut self, _info: PlatformInfo) {}

    fn reset(&mut self, data: &mut Data) {
        for slot in &mut self.tags {
            *slot = [0u64; MAX_CPU_CORES];
        }
        *data = Data::default();
    }

    fn packet_processor(&mut self, _id: usize, reference: &Reference, data: &mut Data) {
        let core = reference.core as usize % MAX_CPU_CORES;
        let proc = reference.processor as usize % NUM_PROCESSORS;
        let hit = self.classify(reference.addr, core);
        let table = if reference.is_fetch() { &mut data.insn_cache } else { &mut data.data_cache };

        let (hit_idx, miss_idx) =
            if reference.is_write() { (WRITE, WRITE_MISS) } else { (READ, READ_MISS) };
        table[proc][LEVEL_L1][core][hit_idx] += 1;
        if !hit {
            table[proc][LEVEL_L1][core][miss_idx] += 1;
            table[proc][LEVEL_MEMORY][core][hit_idx] += 1;
            data.memory_accesses += 1;
            data.memory_time_ns += self.model.latency[LEVEL_MEMORY] as u64;
        }
    }

    fn dump(&mut self, id: usize, data: &Data) {
        tracing::info!(
            worker = id,
            kind = "DirectMapped",
            memory_accesses = data.memory_accesses,
            memory_time_ns = data.memory_time_ns,
            "cache stream dump"
        );
    }
}

pub struct CacheFactory;

impl SimulatorFactory<Cache> for CacheFactory {
    fn create(name: &str) -> Option<Box<dyn Simulator<Cache>>> {
        match name {
            "DirectMapped" => Some(Box::new(DirectMapped::new())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(sim: &mut DirectMapped) -> Model {
        let mut model = Model::default();
        sim.build(&mut model).unwrap();
        model
    }

    #[test]
    fn repeated_access_to_same_line_hits() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();
        bound(&mut sim);

        let mut data = Data::default();
        let reference = Reference::load(0, PROCESSOR_CPU, 0x1000, 4);
        sim.packet_processor(0, &reference, &mut data);
        sim.packet_processor(0, &reference, &mut data);

        assert_eq!(data.data_cache[0][LEVEL_L1][0][READ], 2);
        assert_eq!(data.data_cache[0][LEVEL_L1][0][READ_MISS], 1);
        assert_eq!(data.memory_accesses, 1);
    }

    #[test]
    fn distinct_lines_each_miss_once() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();
        bound(&mut sim);

        let mut data = Data::default();
        for addr in [0x0u64, 0x10000, 0x20000] {
            let reference = Reference::store(0, PROCESSOR_CPU, addr, 8);
            sim.packet_processor(0, &reference, &mut data);
        }

        assert_eq!(data.data_cache[0][LEVEL_L1][0][WRITE_MISS], 3);
        assert_eq!(data.memory_accesses, 3);
    }

    #[test]
    fn reset_clears_tags_so_the_next_access_misses_again() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();
        bound(&mut sim);

        let mut data = Data::default();
        let reference = Reference::load(0, PROCESSOR_CPU, 0x1000, 4);
        sim.packet_processor(0, &reference, &mut data);
        sim.packet_processor(0, &reference, &mut data);
        assert_eq!(data.data_cache[0][LEVEL_L1][0][READ_MISS], 1);

        sim.reset(&mut data);
        assert_eq!(data.memory_accesses, 0);

        // If `reset` left `tags` untouched, this repeat access would hit.
        sim.packet_processor(0, &reference, &mut data);
        assert_eq!(data.data_cache[0][LEVEL_L1][0][READ_MISS], 1);
        assert_eq!(data.memory_accesses, 1);
    }

    #[test]
    fn fetch_references_land_in_the_instruction_cache() {
        let mut sim = DirectMapped::new();
        let cfg = SimConfig { name: "DirectMapped".into(), params: Default::default() };
        sim.bind(&cfg).unwrap();
        bound(&mut sim);

        let mut data = Data::default();
        let reference = Reference::fetch(0, PROCESSOR_CPU, 0x4000, 4);
        sim.packet_processor(0, &reference, &mut data);

        assert_eq!(data.insn_cache[0][LEVEL_L1][0][READ_MISS], 1);
        assert_eq!(data.data_cache[0][LEVEL_L1][0][READ_MISS], 0);
    }

    #[test]
    fn access_kind_is_packed_into_the_type_field_not_separate_flags() {
        let load = Reference::load(0, PROCESSOR_CPU, 0x0, 4);
        let store = Reference::store(0, PROCESSOR_CPU, 0x0, 4);
        let fetch = Reference::fetch(0, PROCESSOR_CPU, 0x0, 4);

        assert!(!load.is_write() && !load.is_fetch());
        assert!(store.is_write() && !store.is_fetch());
        assert!(!fetch.is_write() && fetch.is_fetch());
        assert_eq!(load.packet_type(), PacketType::Data);
        assert_eq!(store.packet_type(), PacketType::Data);
        assert_eq!(fetch.packet_type(), PacketType::Data);
    }
}
