use crate::lifecycle::PodState;

/// Errors returned by hypervisor backends and the types they consume.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing required configuration: {0}")]
    MissingField(&'static str),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("hypervisor binary not found: {0}")]
    BinaryNotFound(String),

    #[error("insufficient host resources: {0}")]
    ResourceExhausted(String),

    #[error("VM did not finish booting within {timeout_ms}ms")]
    BootTimeout { timeout_ms: u64 },

    #[error("VM failed to launch: {0}")]
    LaunchFailed(String),

    #[error("VM shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("cannot {operation} while pod is {state}")]
    InvalidState {
        operation: &'static str,
        state: PodState,
    },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
