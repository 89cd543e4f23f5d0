//! In-memory store for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::job::{AuditRecord, Job, JobStatus, TelemetrySample};
use crate::error::StoreError;
use crate::store::Store;

/// A `Store` holding everything in process memory. Contents do not
/// survive a restart; orphan recovery therefore sees an empty store.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    telemetry: RwLock<HashMap<Uuid, Vec<TelemetrySample>>>,
    audits: RwLock<HashMap<Uuid, AuditRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_jobs(
        &self,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn append_telemetry(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        self.telemetry
            .write()
            .await
            .entry(sample.job_id)
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn latest_telemetry(
        &self,
        job_id: Uuid,
    ) -> Result<Option<TelemetrySample>, StoreError> {
        Ok(self
            .telemetry
            .read()
            .await
            .get(&job_id)
            .and_then(|samples| samples.last().cloned()))
    }

    async fn complete_check(
        &self,
        job: &Job,
        audit: Option<&AuditRecord>,
    ) -> Result<(), StoreError> {
        // Both maps updated under the jobs write lock to mirror the
        // transactional pairing of the Postgres backend.
        let mut jobs = self.jobs.write().await;
        let mut audits = self.audits.write().await;
        jobs.insert(job.id, job.clone());
        if let Some(audit) = audit {
            audits.entry(audit.job_id).or_insert_with(|| audit.clone());
        }
        Ok(())
    }

    async fn get_audit(&self, job_id: Uuid) -> Result<Option<AuditRecord>, StoreError> {
        Ok(self.audits.read().await.get(&job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(task: &str) -> Job {
        Job::new(task.to_string(), "/tmp/project".to_string())
    }

    #[tokio::test]
    async fn round_trips_jobs() {
        let store = MemoryStore::new();
        let j = job("t1");
        store.save_job(&j).await.unwrap();

        let loaded = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.task, "t1");
        assert_eq!(loaded.status, JobStatus::Pending);
        assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_newest_first_with_filter() {
        let store = MemoryStore::new();
        let mut a = job("a");
        a.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut b = job("b");
        b.status = JobStatus::Failed;
        store.save_job(&a).await.unwrap();
        store.save_job(&b).await.unwrap();

        let all = store.list_jobs(50, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].task, "b");

        let failed = store.list_jobs(50, Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task, "b");
    }

    #[tokio::test]
    async fn active_excludes_terminal() {
        let store = MemoryStore::new();
        let a = job("a");
        let mut b = job("b");
        b.status = JobStatus::Completed;
        store.save_job(&a).await.unwrap();
        store.save_job(&b).await.unwrap();

        let active = store.list_active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[tokio::test]
    async fn serves_latest_telemetry() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        for (cpu, tool) in [(10.0, "a"), (20.0, "b")] {
            store
                .append_telemetry(&TelemetrySample {
                    job_id: id,
                    recorded_at: Utc::now(),
                    cpu_percent: cpu,
                    ram_mb: 100.0,
                    current_tool: tool.to_string(),
                })
                .await
                .unwrap();
        }

        let latest = store.latest_telemetry(id).await.unwrap().unwrap();
        assert_eq!(latest.cpu_percent, 20.0);
        assert_eq!(latest.current_tool, "b");
    }

    #[tokio::test]
    async fn audit_is_write_once() {
        let store = MemoryStore::new();
        let mut j = job("t");
        j.status = JobStatus::AwaitingApproval;
        let audit = AuditRecord {
            job_id: j.id,
            payload: serde_json::json!({"summary": "ok"}),
            created_at: Utc::now(),
        };
        store.complete_check(&j, Some(&audit)).await.unwrap();

        let second = AuditRecord {
            payload: serde_json::json!({"summary": "overwritten"}),
            ..audit.clone()
        };
        store.complete_check(&j, Some(&second)).await.unwrap();

        let stored = store.get_audit(j.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, serde_json::json!({"summary": "ok"}));
    }
}
