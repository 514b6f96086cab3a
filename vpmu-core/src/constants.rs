//! Tuning constants for the VPMU streaming engine.

/// Maximum number of guest CPU cores a platform may report.
pub const MAX_CPU_CORES: usize = 16;

/// Maximum number of guest GPU cores a platform may report.
pub const MAX_GPU_CORES: usize = 4;

/// Size of the per-core local batcher (§4.2).
pub const LOCAL_BATCHER_SIZE: usize = 256;

/// Size of a worker's local pop buffer when draining the ring (§4.4.2/4.4.3).
pub const WORKER_POP_BUFFER_SIZE: usize = 1024;

/// Maximum number of workers a single stream may run.
pub const MAX_WORKERS: usize = 32;

/// How many bulk `send` calls elapse between auto-injected BARRIER packets.
/// The original implementation used 4 on one backend and 2 on another; this
/// rewrite uses a single shared constant (see SPEC_FULL.md §9).
pub const SYNC_PERIOD: u32 = 4;

/// Deadline for the producer to observe every worker's `synced_flag` during
/// build, and for SYNC_DATA handshakes.
pub const SYNC_TIMEOUT_MS: u64 = 5_000;

/// Back-pressure spin-nap duration.
pub const BACKPRESSURE_SLEEP: std::time::Duration = std::time::Duration::from_micros(1);

/// Heart-beat producer tick interval (multi-process backend).
pub const HEARTBEAT_TICK: std::time::Duration = std::time::Duration::from_millis(100);

/// Heart-beat sidecar poll interval (multi-process backend).
pub const HEARTBEAT_POLL: std::time::Duration = std::time::Duration::from_millis(500);
