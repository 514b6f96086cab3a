//! Instruction stream: per-mode, per-core retired-instruction accounting
//! fed by the emulator's translation-block counters.
//!
//! `Reference::tb_counters_ptr` points at a counter record owned by the
//! emulator's translation-block metadata, which outlives the packet's
//! traversal of the ring. Because that pointer is only meaningful in the
//! producer's address space, this kind never runs behind the multi-process
//! backend (`SUPPORTS_MULTI_PROCESS = false`).

use crate::config::SimConfig;
use crate::constants::MAX_CPU_CORES;
use crate::error::{Result, VpmuError};
use crate::platform::PlatformInfo;

use super::{Packet, PacketType, Simulator, StreamKind, SimulatorFactory};

const MODE_USR: u8 = 0x10;
const MODE_IRQ: u8 = 0x12;
const MODE_SVC: u8 = 0x13;

/// Pre-tallied counters for one translation block, owned by the emulator.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TbCounters {
    pub total: u64,
    pub load: u64,
    pub store: u64,
    pub has_branch: u64,
    pub ticks: u64,
}

/// One instruction-stream event or control command.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Reference {
    pub ty: PacketType,
    pub num_ex_slots: u8,
    pub core: u8,
    pub mode: u8,
    pub tb_counters_ptr: *const TbCounters,
}

// Safety: the pointer is only dereferenced by the worker that owns this
// reference while the producer guarantees the pointee outlives the
// packet's lifetime in the ring (see module docs).
unsafe impl Send for Reference {}

impl Packet for Reference {
    fn packet_type(&self) -> PacketType {
        self.ty
    }

    fn core(&self) -> u8 {
        self.core
    }

    fn control(ty: PacketType) -> Self {
        Reference { ty, num_ex_slots: 0, core: 0, mode: 0, tb_counters_ptr: std::ptr::null() }
    }
}

impl Reference {
    pub fn data(core: u8, mode: u8, tb_counters_ptr: *const TbCounters) -> Self {
        Reference { ty: PacketType::Data, num_ex_slots: 0, core, mode, tb_counters_ptr }
    }
}

/// Per-mode retired-instruction tally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataCell {
    pub total_inst: u64,
    pub load: u64,
    pub store: u64,
    pub branch: u64,
}

impl std::ops::Add for DataCell {
    type Output = DataCell;
    fn add(self, rhs: DataCell) -> DataCell {
        DataCell {
            total_inst: self.total_inst + rhs.total_inst,
            load: self.load + rhs.load,
            store: self.store + rhs.store,
            branch: self.branch + rhs.branch,
        }
    }
}

/// Aggregated counters for one instruction-stream worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct Data {
    pub user: DataCell,
    pub system: DataCell,
    pub interrupt: DataCell,
    pub rest: DataCell,
    /// Snapshot of `total_inst_count()` per core, published on `BARRIER`.
    pub inst_cnt: [u64; MAX_CPU_CORES],
    /// Cycle-tick accumulator per core, published on `BARRIER`.
    pub cycles: [u64; MAX_CPU_CORES],
}

impl Data {
    pub fn total_inst_count(&self) -> u64 {
        (self.user + self.system + self.interrupt + self.rest).total_inst
    }

    pub fn total_load_count(&self) -> u64 {
        (self.user + self.system + self.interrupt + self.rest).load
    }

    pub fn total_store_count(&self) -> u64 {
        (self.user + self.system + self.interrupt + self.rest).store
    }

    pub fn total_branch_count(&self) -> u64 {
        (self.user + self.system + self.interrupt + self.rest).branch
    }

    pub fn cpu_cycle_count(&self) -> u64 {
        self.cycles.iter().sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    pub name: String,
    pub frequency: u64,
    pub dual_issue: bool,
}

pub struct Instruction;

impl StreamKind for Instruction {
    type Reference = Reference;
    type Data = Data;
    type Model = Model;

    const NAME: &'static str = "instruction";
    const SUPPORTS_MULTI_PROCESS: bool = false;
}

/// Cortex-A9-style in-order pipeline timer: buckets retired instructions by
/// CPU mode and accumulates per-core cycle ticks privately, publishing a
/// coherent snapshot into `Data` on every `BARRIER`.
pub struct CortexA9 {
    cycles: [u64; MAX_CPU_CORES],
    model: Model,
}

impl CortexA9 {
    pub fn new() -> Self {
        CortexA9 { cycles: [0; MAX_CPU_CORES], model: Model::default() }
    }
}

impl Default for CortexA9 {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator<Instruction> for CortexA9 {
    fn name(&self) -> &'static str {
        "CortexA9"
    }

    fn bind(&mut self, config: &SimConfig) -> Result<()> {
        self.model.name = config.get::<String>("name").unwrap_or_else(|| "CortexA9".to_string());
        self.model.frequency = config
            .get::<u64>("frequency")
            .ok_or_else(|| VpmuError::config("CortexA9: missing `frequency`"))?;
        self.model.dual_issue = config.get::<bool>("dual_issue").unwrap_or(false);
        Ok(())
    }

    fn build(&mut self, model: &mut Model) -> Result<()> {
        *model = self.model.clone();
        Ok(())
    }

    fn set_platform_info(&mut self, _info: PlatformInfo) {}

    fn packet_processor(&mut self, _id: usize, reference: &Reference, data: &mut Data) {
        let tb = unsafe { &*reference.tb_counters_ptr };
        let cell = match reference.mode {
            MODE_USR => &mut data.user,
            MODE_SVC => &mut data.system,
            MODE_IRQ => &mut data.interrupt,
            _ => &mut data.rest,
        };
        cell.total_inst += tb.total;
        cell.load += tb.load;
        cell.store += tb.store;
        cell.branch += tb.has_branch;

        let core = reference.core as usize % MAX_CPU_CORES;
        self.cycles[core] += tb.ticks;
    }

    fn barrier(&mut self, _id: usize, data: &mut Data) {
        data.inst_cnt[0] = data.total_inst_count();
        data.cycles = self.cycles;
    }

    fn reset(&mut self, data: &mut Data) {
        self.cycles = [0; MAX_CPU_CORES];
        *data = Data::default();
    }

    fn dump(&mut self, id: usize, data: &Data) {
        tracing::info!(
            worker = id,
            kind = "CortexA9",
            total_inst = data.total_inst_count(),
            user_inst = data.user.total_inst,
            system_inst = data.system.total_inst,
            interrupt_inst = data.interrupt.total_inst,
            rest_inst = data.rest.total_inst,
            total_load = data.total_load_count(),
            total_store = data.total_store_count(),
            total_branch = data.total_branch_count(),
            cycles = data.cpu_cycle_count(),
            "instruction stream dump"
        );
    }
}

pub struct InstructionFactory;

impl SimulatorFactory<Instruction> for InstructionFactory {
    fn create(name: &str) -> Option<Box<dyn Simulator<Instruction>>> {
        match name {
            "CortexA9" => Some(Box::new(CortexA9::new())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb(total: u64, load: u64, store: u64, has_branch: u64, ticks: u64) -> TbCounters {
        TbCounters { total, load, store, has_branch, ticks }
    }

    #[test]
    fn accumulates_user_mode_buckets() {
        let mut sim = CortexA9::new();
        let mut data = Data::default();
        let counters = tb(10, 3, 2, 1, 12);

        for _ in 0..3 {
            let reference = Reference::data(0, MODE_USR, &counters as *const _);
            sim.packet_processor(0, &reference, &mut data);
        }
        sim.barrier(0, &mut data);

        assert_eq!(data.user.total_inst, 30);
        assert_eq!(data.user.load, 9);
        assert_eq!(data.user.store, 6);
        assert_eq!(data.user.branch, 3);
        assert_eq!(data.cycles[0], 36);
    }

    #[test]
    fn irq_mode_is_isolated_from_user() {
        let mut sim = CortexA9::new();
        let mut data = Data::default();
        let counters = tb(7, 1, 1, 0, 5);

        for _ in 0..5 {
            let reference = Reference::data(0, MODE_IRQ, &counters as *const _);
            sim.packet_processor(0, &reference, &mut data);
        }

        assert_eq!(data.interrupt.total_inst, 35);
        assert_eq!(data.user.total_inst, 0);
    }

    #[test]
    fn reset_zeroes_data_and_private_cycles() {
        let mut sim = CortexA9::new();
        let mut data = Data::default();
        let counters = tb(1, 1, 1, 1, 1);
        let reference = Reference::data(0, MODE_USR, &counters as *const _);
        sim.packet_processor(0, &reference, &mut data);

        sim.reset(&mut data);
        sim.barrier(0, &mut data);

        assert_eq!(data.total_inst_count(), 0);
        assert_eq!(data.cycles[0], 0);
    }
}
