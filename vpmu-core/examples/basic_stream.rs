//! Binds a `CortexA9` instruction-stream simulator, sends a handful of
//! translation-block counters across two cores, and prints the aggregated
//! retired-instruction and cycle counts.

use vpmu_core::kinds::instruction::{Instruction, InstructionFactory, Reference, TbCounters};
use vpmu_core::{BackendKind, PlatformInfo, SimConfig, Stream};

fn main() {
    tracing_subscriber::fmt::init();

    let stream: Stream<Instruction, InstructionFactory> = Stream::new();
    let mut params = std::collections::BTreeMap::new();
    params.insert("frequency".to_string(), serde_json::json!(1_200_000_000u64));
    stream.bind(SimConfig { name: "CortexA9".to_string(), params });
    stream.set_backend_kind(BackendKind::MultiThread);
    stream.set_platform_info(PlatformInfo { cpu_cores: 2, gpu_cores: 0, cpu_frequency_hz: 1_200_000_000 });

    if !stream.build().expect("build failed") {
        eprintln!("no simulator matched the configuration");
        return;
    }

    let tb = TbCounters { total: 4, load: 1, store: 1, has_branch: 1, ticks: 12 };
    for core in 0..2u8 {
        for _ in 0..1000 {
            stream.send_ref(core, Reference::data(core, 0x10, &tb as *const _));
        }
    }

    stream.sync().expect("sync failed");

    let data = stream.get_data(0).expect("worker 0 has no data");
    println!("total instructions retired: {}", data.total_inst_count());
    println!("total cycles:               {}", data.cpu_cycle_count());

    stream.dump().expect("dump failed");
    stream.destroy();
}
