//! End-to-end scenarios driven entirely through the `Stream` front-end,
//! covering the control protocol and per-mode accounting across backends.

use std::collections::BTreeMap;

use vpmu_core::kinds::instruction::{Instruction, InstructionFactory, Reference, TbCounters};
use vpmu_core::{BackendKind, SimConfig, Stream, StreamConfig};

const MODE_USR: u8 = 0x10;
const MODE_IRQ: u8 = 0x12;

fn cortex_a9_config() -> StreamConfig {
    let mut params = BTreeMap::new();
    params.insert("frequency".to_string(), serde_json::json!(1_000_000_000u64));
    StreamConfig::One(SimConfig { name: "CortexA9".to_string(), params })
}

fn two_cortex_a9_configs() -> StreamConfig {
    StreamConfig::Many(vec![
        SimConfig {
            name: "CortexA9".to_string(),
            params: BTreeMap::from([("frequency".to_string(), serde_json::json!(1_000_000_000u64))]),
        },
        SimConfig {
            name: "CortexA9".to_string(),
            params: BTreeMap::from([("frequency".to_string(), serde_json::json!(900_000_000u64))]),
        },
    ])
}

#[test]
fn single_worker_user_mode_accounting() {
    for backend in [BackendKind::SingleThreaded, BackendKind::MultiThread] {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        stream.bind(cortex_a9_config());
        stream.set_backend_kind(backend);
        assert!(stream.build().unwrap());

        let tb = TbCounters { total: 10, load: 3, store: 2, has_branch: 1, ticks: 12 };
        for _ in 0..3 {
            stream.send_ref(0, Reference::data(0, MODE_USR, &tb as *const _));
        }
        stream.sync().unwrap();

        let data = stream.get_data(0).unwrap();
        assert_eq!(data.user.total_inst, 30);
        assert_eq!(data.user.load, 9);
        assert_eq!(data.user.store, 6);
        assert_eq!(data.user.branch, 3);
        assert_eq!(data.cycles[0], 36);

        stream.destroy();
    }
}

#[test]
fn dump_does_not_hang_with_two_workers() {
    let stream: Stream<Instruction, InstructionFactory> = Stream::new();
    stream.bind(two_cortex_a9_configs());
    stream.set_backend_kind(BackendKind::MultiThread);
    assert!(stream.build().unwrap());
    assert_eq!(stream.get_num_workers(), 2);

    stream.sync().unwrap();
    stream.dump().unwrap();

    stream.destroy();
}

#[test]
fn back_pressure_does_not_lose_packets_on_a_small_ring() {
    let stream: Stream<Instruction, InstructionFactory> = Stream::new();
    stream.bind(cortex_a9_config());
    stream.set_ring_capacity(64);
    stream.set_backend_kind(BackendKind::MultiThread);
    assert!(stream.build().unwrap());

    let tb = TbCounters { total: 1, load: 0, store: 0, has_branch: 0, ticks: 1 };
    for _ in 0..1000 {
        stream.send_ref(0, Reference::data(0, MODE_USR, &tb as *const _));
    }
    stream.sync().unwrap();

    assert_eq!(stream.get_data(0).unwrap().total_inst_count(), 1000);

    stream.destroy();
}

#[test]
fn reset_after_activity_returns_to_zero() {
    let stream: Stream<Instruction, InstructionFactory> = Stream::new();
    stream.bind(cortex_a9_config());
    stream.set_backend_kind(BackendKind::SingleThreaded);
    assert!(stream.build().unwrap());

    let tb = TbCounters { total: 1, load: 1, store: 1, has_branch: 1, ticks: 1 };
    stream.reset();
    for _ in 0..50 {
        stream.send_ref(0, Reference::data(0, MODE_USR, &tb as *const _));
    }
    stream.sync().unwrap();
    assert_eq!(stream.get_data(0).unwrap().total_inst_count(), 50);

    stream.reset();
    stream.sync().unwrap();

    let data = stream.get_data(0).unwrap();
    assert_eq!(data.total_inst_count(), 0);
    assert_eq!(data.cycles[0], 0);

    stream.destroy();
}

#[test]
fn irq_mode_refs_do_not_leak_into_user_bucket() {
    let stream: Stream<Instruction, InstructionFactory> = Stream::new();
    stream.bind(two_cortex_a9_configs());
    stream.set_backend_kind(BackendKind::MultiThread);
    assert!(stream.build().unwrap());

    let tb = TbCounters { total: 2, load: 0, store: 0, has_branch: 0, ticks: 2 };
    for _ in 0..5 {
        stream.send_ref(0, Reference::data(0, MODE_IRQ, &tb as *const _));
    }
    stream.sync().unwrap();

    let data = stream.get_data(0).unwrap();
    assert_eq!(data.interrupt.total_inst, 10);
    assert_eq!(data.user.total_inst, 0);

    stream.destroy();
}
