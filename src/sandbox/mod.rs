//! Sandbox driver: a thin capability layer over the container runtime.

pub mod docker;
pub mod driver;
pub mod error;

pub use docker::{DockerDriver, connect_docker};
pub use driver::{MountSpec, SandboxDriver, SandboxId, SandboxSpec, SandboxState};
pub use error::SandboxError;

/// Name prefix for every sandbox this control plane creates, so the
/// sentinel can enumerate its scope without touching unrelated containers.
pub const SANDBOX_NAME_PREFIX: &str = "icarus_";
