//! Sandbox failure kinds.

/// Why a script invocation produced no result.
///
/// The leading words of each message are stable so callers and tests can
/// tell the kinds apart from the rendered text alone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("instruction limit exceeded ({limit} instructions)")]
    InstructionLimit { limit: u64 },

    #[error("memory limit exceeded ({limit_bytes} bytes)")]
    MemoryLimit { limit_bytes: usize },

    #[error("script error: {0}")]
    Script(String),

    #[error("cancelled")]
    Cancelled,

    #[error("sandbox setup failed: {0}")]
    Setup(String),
}
