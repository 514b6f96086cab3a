//! Error types for the VPMU streaming engine.

use thiserror::Error;

/// Result type alias for fallible VPMU operations.
pub type Result<T> = std::result::Result<T, VpmuError>;

/// Errors a caller can recover from: construction-time and control-plane
/// failures. Protocol violations deep inside a running worker loop are not
/// modeled here — they escalate straight to a fatal log + abort (see §7 of
/// the design) because there is no caller left to hand a `Result` to.
#[derive(Error, Debug)]
pub enum VpmuError {
    /// I/O failure setting up or tearing down a shared-memory segment.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad configuration: ring size not a power of two, no simulators
    /// matched a config entry, etc.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// A producer-side wait (sync handshake, worker build readiness)
    /// exceeded its deadline.
    #[error("timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    /// A specific worker failed to raise its liveness flag in time.
    #[error("worker {id} did not respond (possibly dead)")]
    WorkerDown { id: usize },

    /// Errno from a libc/nix system call (fork, mmap, sem_init, ...).
    #[error("system call failed: {0}")]
    System(#[from] nix::Error),

    /// A stream-kind/backend combination that is never valid, e.g.
    /// requesting the multi-process backend for a stream kind whose
    /// packets carry a raw pointer (see `StreamKind::SUPPORTS_MULTI_PROCESS`).
    #[error("backend {backend} does not support stream kind {kind}")]
    UnsupportedBackend { backend: &'static str, kind: &'static str },
}

impl VpmuError {
    pub fn config(message: impl Into<String>) -> Self {
        VpmuError::Config { message: message.into() }
    }
}
