//! C-callable producer API for the VPMU trace streaming engine (§6).
//!
//! Wraps one process-wide `Stream` per stream kind behind a
//! `OnceLock<Mutex<...>>` handle table, exposing `extern "C"` entry points an
//! emulator can call directly. The underlying `Stream<K, F>` values are
//! ordinary Rust values — the only thing global here is *which* instance a
//! bare C function call reaches.

use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use vpmu_core::kinds::branch::Reference as BranchReference;
use vpmu_core::kinds::cache::{Reference as CacheReference, PROCESSOR_CPU};
use vpmu_core::kinds::instruction::{Reference as InstructionReference, TbCounters};
use vpmu_core::{
    BackendKind, Branch, BranchFactory, Cache, CacheFactory, Instruction, InstructionFactory,
    PlatformInfo, Stream, StreamConfig,
};

static INSTRUCTION: OnceLock<Mutex<Stream<Instruction, InstructionFactory>>> = OnceLock::new();
static CACHE: OnceLock<Mutex<Stream<Cache, CacheFactory>>> = OnceLock::new();
static BRANCH: OnceLock<Mutex<Stream<Branch, BranchFactory>>> = OnceLock::new();

/// Process-wide I/O-mapped access cycle accumulator, incremented by
/// `io_mem_access_ref` and folded into `cpu_cycle_count` (§6).
static IO_CYCLES: AtomicU64 = AtomicU64::new(0);

fn instruction() -> &'static Mutex<Stream<Instruction, InstructionFactory>> {
    INSTRUCTION.get_or_init(|| Mutex::new(Stream::new()))
}

fn cache() -> &'static Mutex<Stream<Cache, CacheFactory>> {
    CACHE.get_or_init(|| Mutex::new(Stream::new()))
}

fn branch() -> &'static Mutex<Stream<Branch, BranchFactory>> {
    BRANCH.get_or_init(|| Mutex::new(Stream::new()))
}

/// # Safety
/// `json` must be null or point at a NUL-terminated UTF-8 C string valid for
/// the duration of this call.
unsafe fn parse_config(json: *const c_char) -> Option<StreamConfig> {
    if json.is_null() {
        return None;
    }
    let s = CStr::from_ptr(json).to_str().ok()?;
    serde_json::from_str(s).ok()
}

/// Install a global `tracing_subscriber::fmt` subscriber. Idempotent; a
/// library crate must never install one on its own (§7.2), so the emulator
/// calls this once at startup.
#[no_mangle]
pub extern "C" fn vpmu_init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// # Safety
/// `config_json` must be null or a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn vpmu_bind_instruction(config_json: *const c_char) -> bool {
    match parse_config(config_json) {
        Some(cfg) => {
            instruction().lock().bind(cfg);
            true
        }
        None => false,
    }
}

/// # Safety
/// `config_json` must be null or a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn vpmu_bind_cache(config_json: *const c_char) -> bool {
    match parse_config(config_json) {
        Some(cfg) => {
            cache().lock().bind(cfg);
            true
        }
        None => false,
    }
}

/// # Safety
/// `config_json` must be null or a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn vpmu_bind_branch(config_json: *const c_char) -> bool {
    match parse_config(config_json) {
        Some(cfg) => {
            branch().lock().bind(cfg);
            true
        }
        None => false,
    }
}

/// Build every bound stream against the given platform topology. Streams
/// with no prior `vpmu_bind_*` call simply build zero workers and report
/// `false` for that stream's contribution (§6: "an empty result list is
/// fatal" — the emulator should treat an overall `false` as such).
#[no_mangle]
pub extern "C" fn vpmu_build_all(cpu_cores: u32, gpu_cores: u32, cpu_frequency_hz: u64) -> bool {
    let platform = PlatformInfo { cpu_cores, gpu_cores, cpu_frequency_hz };

    let inst = instruction().lock();
    inst.set_platform_info(platform);
    let inst_ok = inst.build().unwrap_or_else(|err| {
        tracing::error!(error = %err, "instruction stream build failed");
        false
    });
    drop(inst);

    let cache_stream = cache().lock();
    cache_stream.set_platform_info(platform);
    cache_stream.set_backend_kind(BackendKind::MultiThread);
    let cache_ok = cache_stream.build().unwrap_or_else(|err| {
        tracing::error!(error = %err, "cache stream build failed");
        false
    });
    drop(cache_stream);

    let branch_stream = branch().lock();
    branch_stream.set_platform_info(platform);
    branch_stream.set_backend_kind(BackendKind::MultiThread);
    let branch_ok = branch_stream.build().unwrap_or_else(|err| {
        tracing::error!(error = %err, "branch stream build failed");
        false
    });

    inst_ok && cache_ok && branch_ok
}

/// # Safety
/// `tb_counters_ptr` must point at a `TbCounters` record that stays readable
/// until the instruction stream has drained this reference (§3, Reference
/// invariants).
#[no_mangle]
pub unsafe extern "C" fn inst_ref(core: u8, mode: u8, tb_counters_ptr: *const TbCounters) {
    instruction().lock().send_ref(core, InstructionReference::data(core, mode, tb_counters_ptr));
}

#[no_mangle]
pub extern "C" fn cache_ref(core: u8, processor: u8, addr: u64, size: u16, is_write: bool, is_fetch: bool) {
    let reference = if is_write {
        CacheReference::store(core, processor, addr, size)
    } else if is_fetch {
        CacheReference::fetch(core, processor, addr, size)
    } else {
        CacheReference::load(core, processor, addr, size)
    };
    cache().lock().send_ref(core, reference);
}

#[no_mangle]
pub extern "C" fn branch_ref(core: u8, pc: u64, taken: bool) {
    branch().lock().send_ref(core, BranchReference::branch(core, pc, taken));
}

/// Record `cycles` spent on a DMA/IO-mapped access, folded into
/// `cpu_cycle_count`/`io_mem_access_cycle_count` (§6).
#[no_mangle]
pub extern "C" fn io_mem_access_ref(cycles: u64) {
    IO_CYCLES.fetch_add(cycles, Ordering::Relaxed);
}

#[no_mangle]
pub extern "C" fn total_inst_count() -> u64 {
    instruction().lock().get_data(0).map(|d| d.total_inst_count()).unwrap_or(0)
}

/// `VPMU.ticks + cache_cycles + io_cycles`, mirroring the original
/// collaborator's cycle-count composition (§6).
#[no_mangle]
pub extern "C" fn cpu_cycle_count() -> u64 {
    let inst_cycles = instruction().lock().get_data(0).map(|d| d.cpu_cycle_count()).unwrap_or(0);
    let cache_cycles = sys_mem_access_cycle_count();
    let io_cycles = IO_CYCLES.load(Ordering::Relaxed);
    inst_cycles + cache_cycles + io_cycles
}

#[no_mangle]
pub extern "C" fn sys_mem_access_cycle_count() -> u64 {
    cache().lock().get_data(0).map(|d| d.memory_cycles(PROCESSOR_CPU as usize)).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn io_mem_access_cycle_count() -> u64 {
    IO_CYCLES.load(Ordering::Relaxed)
}

/// Inject a `BARRIER` into every stream and block until each worker has
/// published a coherent snapshot (§4.5). The emulator calls this
/// periodically so `total_inst_count`/`cpu_cycle_count` observe fresh data.
#[no_mangle]
pub extern "C" fn sync_all_streams() -> bool {
    let inst_ok = instruction().lock().sync().is_ok();
    let cache_ok = cache().lock().sync().is_ok();
    let branch_ok = branch().lock().sync().is_ok();
    inst_ok && cache_ok && branch_ok
}

#[no_mangle]
pub extern "C" fn dump_readable_message() {
    let _ = instruction().lock().dump();
    let _ = cache().lock().dump();
    let _ = branch().lock().dump();
}

#[no_mangle]
pub extern "C" fn reset_all_streams() {
    instruction().lock().reset();
    cache().lock().reset();
    branch().lock().reset();
    IO_CYCLES.store(0, Ordering::Relaxed);
}

#[no_mangle]
pub extern "C" fn destroy_all_streams() {
    instruction().lock().destroy();
    cache().lock().destroy();
    branch().lock().destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn reset() {
        destroy_all_streams();
        IO_CYCLES.store(0, Ordering::Relaxed);
    }

    #[test]
    fn end_to_end_through_the_c_surface() {
        reset();
        let cfg = CString::new(r#"{"name":"CortexA9","frequency":1000000000}"#).unwrap();
        unsafe {
            assert!(vpmu_bind_instruction(cfg.as_ptr()));
        }
        assert!(vpmu_build_all(1, 0, 1_000_000_000));

        let tb = TbCounters { total: 4, load: 1, store: 1, has_branch: 0, ticks: 10 };
        unsafe {
            inst_ref(0, 0x10, &tb as *const _);
        }
        assert!(sync_all_streams());

        assert_eq!(total_inst_count(), 4);
        assert_eq!(cpu_cycle_count(), 10);

        destroy_all_streams();
    }

    #[test]
    fn io_accumulator_folds_into_cpu_cycle_count() {
        reset();
        io_mem_access_ref(7);
        assert_eq!(io_mem_access_cycle_count(), 7);
        assert_eq!(cpu_cycle_count(), 7);
        reset();
    }

    #[test]
    fn unknown_simulator_name_fails_build() {
        reset();
        let cfg = CString::new(r#"{"name":"NoSuchModel"}"#).unwrap();
        unsafe {
            assert!(vpmu_bind_instruction(cfg.as_ptr()));
        }
        assert!(!vpmu_build_all(1, 0, 1_000_000_000));
        reset();
    }
}
