//! Persistence abstraction.
//!
//! The store exclusively owns persisted bytes; the engine pairs every
//! status transition with a write here before anything is broadcast.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::job::{AuditRecord, Job, JobStatus, TelemetrySample};
use crate::error::StoreError;

/// Persistence surface for jobs, telemetry, and audit records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a job row.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Newest first, optionally filtered by status.
    async fn list_jobs(
        &self,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Every job in a non-terminal status, for startup recovery.
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Append one worker heartbeat.
    async fn append_telemetry(&self, sample: &TelemetrySample) -> Result<(), StoreError>;

    /// The most recent heartbeat for a job, if any.
    async fn latest_telemetry(&self, job_id: Uuid)
        -> Result<Option<TelemetrySample>, StoreError>;

    /// Persist the `checking -> awaiting_approval` transition together with
    /// the audit record, atomically.
    async fn complete_check(
        &self,
        job: &Job,
        audit: Option<&AuditRecord>,
    ) -> Result<(), StoreError>;

    async fn get_audit(&self, job_id: Uuid) -> Result<Option<AuditRecord>, StoreError>;
}
