//! Error types for the sandbox driver.

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The container runtime is not reachable.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// The requested image does not exist locally or in the registry.
    #[error("image not found: {image}")]
    ImageNotFound { image: String },

    /// The runtime refused the creation for lack of resources.
    #[error("out of resources: {reason}")]
    OutOfResources { reason: String },

    /// No sandbox with the given handle.
    #[error("sandbox not found: {handle}")]
    NotFound { handle: String },

    /// The sandbox is not in a state that permits the operation
    /// (e.g. pausing an exited container).
    #[error("invalid state for {operation} on {handle}")]
    StateInvalid {
        handle: String,
        operation: &'static str,
    },

    /// Failed to create the sandbox.
    #[error("sandbox creation failed: {reason}")]
    CreationFailed { reason: String },

    /// Failed to start the sandbox.
    #[error("sandbox start failed: {reason}")]
    StartFailed { reason: String },

    /// Docker API error not covered by a more specific variant.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
