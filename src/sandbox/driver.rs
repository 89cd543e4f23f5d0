//! The capability layer the engine and sentinel depend on.
//!
//! Everything the control plane knows about containers goes through
//! `SandboxDriver`; the Docker implementation lives in `docker.rs` and
//! tests substitute their own.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::sandbox::error::Result;

/// Opaque handle to a live or exited sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(pub String);

impl SandboxId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxId {
    fn from(s: String) -> Self {
        SandboxId(s)
    }
}

/// Workspace mount for one sandbox.
#[derive(Debug, Clone)]
pub struct MountSpec {
    /// Host directory to mount.
    pub source: PathBuf,
    /// Builder mounts read/write, checker read-only.
    pub read_only: bool,
}

impl MountSpec {
    /// Container-side mount point. Per-job and isolated.
    pub const TARGET: &'static str = "/workspace";
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    /// Fractional cores, best-effort cap enforced by the runtime.
    pub cpu_limit: f64,
    pub memory_limit_bytes: u64,
    pub env: HashMap<String, String>,
    pub mount: MountSpec,
    pub network_mode: String,
    /// Prefixed `icarus_` so the sentinel can enumerate its scope.
    pub name: String,
}

/// Observed runtime state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Running,
    Paused,
    Exited { exit_code: i64 },
}

/// Thin abstraction over the container runtime.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Create a sandbox with resource limits. Does not start it.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId>;

    async fn start(&self, id: &SandboxId) -> Result<()>;

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxState>;

    async fn pause(&self, id: &SandboxId) -> Result<()>;

    async fn unpause(&self, id: &SandboxId) -> Result<()>;

    /// Idempotent: killing a sandbox that is already dead succeeds.
    async fn kill(&self, id: &SandboxId) -> Result<()>;

    /// Idempotent: removing a sandbox that is already gone succeeds.
    async fn remove(&self, id: &SandboxId) -> Result<()>;

    /// Currently live sandboxes whose name starts with `name_prefix`.
    async fn list(&self, name_prefix: &str) -> Result<Vec<SandboxId>>;

    /// Lazy finite sequence of log lines; ends when the sandbox exits.
    fn tail_logs(&self, id: &SandboxId) -> BoxStream<'static, String>;
}
