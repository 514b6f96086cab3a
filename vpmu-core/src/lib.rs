//! vpmu-core - Virtual performance monitoring unit trace streaming engine

pub mod backend;
pub mod batcher;
pub mod config;
pub mod constants;
pub mod error;
pub mod kinds;
pub mod platform;
pub mod ring;
pub mod sem;
pub mod stream;

pub use backend::BackendKind;
pub use config::{SimConfig, StreamConfig};
pub use error::{Result, VpmuError};
pub use kinds::{ModelName, Packet, PacketType, Simulator, SimulatorFactory, StreamKind};
pub use platform::PlatformInfo;
pub use stream::Stream;

pub use kinds::branch::{Branch, BranchFactory};
pub use kinds::cache::{Cache, CacheFactory};
pub use kinds::instruction::{Instruction, InstructionFactory};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::instruction::{Reference, TbCounters};

    #[test]
    fn stream_builds_and_accepts_data() {
        let stream: Stream<Instruction, InstructionFactory> = Stream::new();
        let mut params = std::collections::BTreeMap::new();
        params.insert("frequency".to_string(), serde_json::json!(1_200_000_000u64));
        stream.bind(SimConfig { name: "CortexA9".into(), params });
        stream.set_backend_kind(BackendKind::SingleThreaded);

        assert!(stream.build().unwrap());

        let tb = TbCounters { total: 1, load: 0, store: 0, has_branch: 0, ticks: 1 };
        stream.send_ref(0, Reference::data(0, 0x10, &tb as *const _));
        stream.sync().unwrap();

        assert_eq!(stream.get_data(0).unwrap().total_inst_count(), 1);
    }
}
