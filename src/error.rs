//! Error types shared across the control plane.
//!
//! Each subsystem gets its own enum; `anyhow` is reserved for the binary
//! edge in `main.rs`. The sandbox layer keeps its own `SandboxError` in
//! `sandbox::error`.

use uuid::Uuid;

use crate::engine::job::JobStatus;

/// Errors surfaced by the job engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No job with the given id exists.
    #[error("unknown job {0}")]
    UnknownJob(Uuid),

    /// The requested operation is illegal in the job's current status.
    #[error("job {job_id} is {status}, operation requires {required}")]
    Conflict {
        job_id: Uuid,
        status: JobStatus,
        required: &'static str,
    },

    /// A status edge outside the transition table was attempted.
    #[error("illegal transition {from} -> {to} for job {job_id}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// The submitted task text failed validation.
    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },

    /// The engine is shutting down and refuses new work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection pool creation or checkout failed.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A query failed.
    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Schema migration failed.
    #[error("migration failed: {0}")]
    Migration(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {reason}")]
    Corrupt { reason: String },
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Errors from the commit gate.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// The git invocation itself could not be spawned.
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    /// git exited non-zero; the message carries the remote's output.
    #[error("{message}")]
    CommandFailed { message: String },
}

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}
