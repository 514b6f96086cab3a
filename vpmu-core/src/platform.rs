//! Platform description handed to every simulator at build time.

use serde::{Deserialize, Serialize};

/// Immutable snapshot of the emulated machine's topology, copied by value
/// into every worker (thread or shared-memory slot) at build time.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub cpu_cores: u32,
    pub gpu_cores: u32,
    pub cpu_frequency_hz: u64,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        PlatformInfo { cpu_cores: 1, gpu_cores: 0, cpu_frequency_hz: 1_000_000_000 }
    }
}
