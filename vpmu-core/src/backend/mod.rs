//! Stream backends (§4.4): interchangeable execution strategies behind the
//! same `StreamBackend` contract, so `Stream<K>` (src/stream.rs) never
//! knows whether its workers are inline calls, threads, or forked
//! processes.

pub mod multi_process;
pub mod multi_thread;
pub mod single_threaded;

pub mod heartbeat;

use crate::error::Result;
use crate::kinds::{Packet, PacketType, Simulator, StreamKind};
use crate::platform::PlatformInfo;

pub use multi_process::MultiProcess;
pub use multi_thread::MultiThread;
pub use single_threaded::SingleThreaded;

/// Which backend a stream should prefer absent an explicit override
/// (`Stream::set_default_stream_impl`, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    SingleThreaded,
    MultiThread,
    MultiProcess,
}

/// Contract shared by all three backends (§4.4): "build common resources;
/// spawn workers; accept sends; propagate control packets".
pub trait StreamBackend<K: StreamKind>: Send {
    /// Take ownership of `workers`, spawn their execution contexts, and
    /// block until every worker has published `synced_flag = true`.
    fn run(&mut self, workers: Vec<Box<dyn Simulator<K>>>, platform: PlatformInfo) -> Result<()>;

    /// Push a batch of references (data or control) into the stream.
    fn send(&self, refs: &[K::Reference]);

    /// `RESET` — zero every worker's state.
    fn reset(&self);

    /// `BARRIER` / `send_sync` — double-barrier protocol: block until the
    /// ring is empty for every reader (§4.5).
    fn sync(&self) -> Result<()>;

    /// `send_sync_none_blocking` — inject a `BARRIER`, don't wait.
    fn sync_none_blocking(&self);

    /// `SYNC_DATA` / `issue_sync` + `wait_sync` — reset every worker's
    /// `synced_flag`, send one `SYNC_DATA`, then poll every flag with a
    /// bounded timeout (§4.5, §4.6).
    fn sync_data(&self) -> Result<()>;

    /// `DUMP_INFO` — every worker prints, strictly in ascending worker id.
    fn dump(&self) -> Result<()>;

    fn get_data(&self, worker_idx: usize) -> Option<K::Data>;
    fn get_model(&self, worker_idx: usize) -> Option<K::Model>;
    fn num_workers(&self) -> usize;

    /// Tear down every worker's execution context. Idempotent.
    fn destroy(&mut self);
}

/// Route one packet to one simulator, covering both data and control
/// packet types (§4.3). Shared by every backend so the dispatch rules
/// cannot drift between them.
pub(crate) fn dispatch<K: StreamKind>(
    sim: &mut dyn Simulator<K>,
    id: usize,
    reference: &K::Reference,
    data: &mut K::Data,
) {
    match reference.packet_type() {
        PacketType::Data => sim.packet_processor(id, reference, data),
        PacketType::Hot => sim.hot_packet_processor(id, reference, data),
        PacketType::Barrier | PacketType::SyncData => sim.barrier(id, data),
        PacketType::Reset => sim.reset(data),
        PacketType::DumpInfo => sim.dump(id, data),
    }
}
