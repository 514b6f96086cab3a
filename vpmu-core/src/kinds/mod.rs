//! Stream kinds and the simulator contract (§4.3, §4.7.1).
//!
//! A *stream kind* fixes three associated types — the wire packet, the
//! aggregated data it accumulates into, and the model descriptor a
//! simulator publishes at build time — plus whether streams of this kind
//! may run behind the multi-process backend. Everything generic (ring,
//! batcher, backends, control protocol) is written once against
//! `StreamKind`/`Packet`/`Simulator` and instantiated per kind.

pub mod branch;
pub mod cache;
pub mod instruction;

use crate::config::SimConfig;
use crate::error::Result;
use crate::platform::PlatformInfo;

/// Control/data discriminant carried by every packet, regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum PacketType {
    #[default]
    Data = 0,
    Hot = 1,
    Barrier = 2,
    Reset = 3,
    DumpInfo = 4,
    SyncData = 5,
}

/// Behaviour every kind-specific packet struct must supply so the backends
/// can dispatch control packets without knowing the kind's payload layout.
pub trait Packet: Copy + Send {
    fn packet_type(&self) -> PacketType;
    fn core(&self) -> u8;

    /// Build a bare control packet (no payload) of the given type, addressed
    /// to core 0. Used by backends to synthesize BARRIER/RESET/DUMP_INFO/
    /// SYNC_DATA packets, which carry no kind-specific payload.
    fn control(ty: PacketType) -> Self;
}

/// Fixes the three types and the capability flag that together define one
/// stream kind (instruction / cache / branch).
pub trait StreamKind: 'static {
    type Reference: Packet + Default;
    type Data: Default + Clone + Send;
    type Model: Default + Clone + Send;

    const NAME: &'static str;

    /// Whether a stream of this kind may run behind the multi-process
    /// backend. `false` for kinds whose `Reference` carries a raw pointer
    /// into producer-owned memory, since that pointer is meaningless in a
    /// forked child's address space (§9 design notes).
    const SUPPORTS_MULTI_PROCESS: bool;
}

/// A pluggable timing simulator for one stream kind (§4.3).
///
/// Implementors own no references to other simulators; all communication
/// with the producer happens through mutations of the `Data` slot the
/// backend hands them and, for `DUMP_INFO`, through `dump`'s console
/// output.
pub trait Simulator<K: StreamKind>: Send {
    /// Human-readable simulator name, used in dump headers and logging.
    fn name(&self) -> &'static str;

    /// Parse `config` into this simulator's internal parameters. Called
    /// once, before `build`.
    fn bind(&mut self, config: &SimConfig) -> Result<()>;

    /// Initialise `model` (written once, read by the producer thereafter)
    /// and any internal state. Called once per worker lifetime, on the
    /// worker's own thread/process.
    fn build(&mut self, model: &mut K::Model) -> Result<()>;

    /// Record the emulated platform's topology (core counts, frequency).
    fn set_platform_info(&mut self, info: PlatformInfo);

    /// Handle a `DATA` packet: accumulate `reference`'s payload into `data`.
    fn packet_processor(&mut self, id: usize, reference: &K::Reference, data: &mut K::Data);

    /// Handle a `HOT_*` packet — functionally identical to `DATA` but
    /// routed separately so a simulator may special-case the hottest event
    /// shape. Defaults to `packet_processor`.
    fn hot_packet_processor(&mut self, id: usize, reference: &K::Reference, data: &mut K::Data) {
        self.packet_processor(id, reference, data)
    }

    /// Publish a coherent snapshot of `data` for the producer to read
    /// (called on `BARRIER`). The default is a no-op: simulators whose
    /// `Data` is always consistent (no derived running totals) need not
    /// override it.
    fn barrier(&mut self, _id: usize, _data: &mut K::Data) {}

    /// Zero all internal state and `*data` (called on `RESET`).
    fn reset(&mut self, data: &mut K::Data) {
        *data = K::Data::default();
    }

    /// Print a human-readable summary of `data` to the console, called
    /// under the dump serialization token so worker outputs never
    /// interleave (§4.5).
    fn dump(&mut self, id: usize, data: &K::Data);
}

/// Per-kind extension point: maps a configuration entry's `name` to a
/// freshly constructed simulator (§4.7, "the factory `create_sim(name)`").
pub trait SimulatorFactory<K: StreamKind> {
    fn create(name: &str) -> Option<Box<dyn Simulator<K>>>;
}

/// Longest model name a fixed-size buffer will hold before truncating.
pub const MODEL_NAME_MAX: usize = 32;

/// A model name that fits inline in a `Copy` struct, so `Cache::Model` and
/// `Branch::Model` can be placed directly in the multi-process backend's
/// shared memory — a `String` there would point at a heap that doesn't
/// exist in the forked child's address space.
#[derive(Clone, Copy)]
pub struct ModelName {
    bytes: [u8; MODEL_NAME_MAX],
    len: u8,
}

impl ModelName {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl Default for ModelName {
    fn default() -> Self {
        ModelName { bytes: [0; MODEL_NAME_MAX], len: 0 }
    }
}

impl From<&str> for ModelName {
    fn from(s: &str) -> Self {
        let bytes = s.as_bytes();
        let len = bytes.len().min(MODEL_NAME_MAX);
        let mut buf = [0u8; MODEL_NAME_MAX];
        buf[..len].copy_from_slice(&bytes[..len]);
        ModelName { bytes: buf, len: len as u8 }
    }
}

impl std::fmt::Debug for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModelName").field(&self.as_str()).finish()
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for ModelName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ModelName {}
