//! PostgreSQL store.

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::engine::job::{AuditRecord, Job, JobStatus, TelemetrySample};
use crate::error::StoreError;
use crate::store::Store;

mod migrations {
    refinery::embed_migrations!("migrations");
}

/// Store backed by a deadpool connection pool.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Connect and verify the pool with one checkout.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Run embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut client = self.pool.get().await?;
        migrations::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }
}

fn job_from_row(row: &Row) -> Result<Job, StoreError> {
    let status: String = row.get("status");
    let status = status.parse::<JobStatus>().map_err(|reason| StoreError::Corrupt { reason })?;
    Ok(Job {
        id: row.get("id"),
        task: row.get("task"),
        project_path: row.get("project_path"),
        status,
        builder_sandbox_id: row.get("builder_sandbox_id"),
        checker_sandbox_id: row.get("checker_sandbox_id"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
        review_comment: row.get("review_comment"),
    })
}

const UPSERT_JOB: &str = "\
    INSERT INTO jobs (id, task, project_path, status, builder_sandbox_id, \
                      checker_sandbox_id, created_at, completed_at, \
                      error_message, review_comment) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
    ON CONFLICT (id) DO UPDATE SET \
        status = EXCLUDED.status, \
        builder_sandbox_id = EXCLUDED.builder_sandbox_id, \
        checker_sandbox_id = EXCLUDED.checker_sandbox_id, \
        completed_at = EXCLUDED.completed_at, \
        error_message = EXCLUDED.error_message, \
        review_comment = EXCLUDED.review_comment";

#[async_trait]
impl Store for PostgresStore {
    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                UPSERT_JOB,
                &[
                    &job.id,
                    &job.task,
                    &job.project_path,
                    &job.status.as_str(),
                    &job.builder_sandbox_id,
                    &job.checker_sandbox_id,
                    &job.created_at,
                    &job.completed_at,
                    &job.error_message,
                    &job.review_comment,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM jobs WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        let rows = match status {
            Some(status) => {
                client
                    .query(
                        "SELECT * FROM jobs WHERE status = $1 \
                         ORDER BY created_at DESC, id DESC LIMIT $2",
                        &[&status.as_str(), &limit],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        "SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT $1",
                        &[&limit],
                    )
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM jobs \
                 WHERE status NOT IN ('completed', 'failed', 'rejected') \
                 ORDER BY created_at ASC, id ASC",
                &[],
            )
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn append_telemetry(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO telemetry_samples \
                 (job_id, recorded_at, cpu_percent, ram_mb, current_tool) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &sample.job_id,
                    &sample.recorded_at,
                    &sample.cpu_percent,
                    &sample.ram_mb,
                    &sample.current_tool,
                ],
            )
            .await?;
        Ok(())
    }

    async fn latest_telemetry(
        &self,
        job_id: Uuid,
    ) -> Result<Option<TelemetrySample>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT job_id, recorded_at, cpu_percent, ram_mb, current_tool \
                 FROM telemetry_samples WHERE job_id = $1 \
                 ORDER BY recorded_at DESC, id DESC LIMIT 1",
                &[&job_id],
            )
            .await?;
        Ok(row.map(|row| TelemetrySample {
            job_id: row.get("job_id"),
            recorded_at: row.get("recorded_at"),
            cpu_percent: row.get("cpu_percent"),
            ram_mb: row.get("ram_mb"),
            current_tool: row.get("current_tool"),
        }))
    }

    async fn complete_check(
        &self,
        job: &Job,
        audit: Option<&AuditRecord>,
    ) -> Result<(), StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute(
            UPSERT_JOB,
            &[
                &job.id,
                &job.task,
                &job.project_path,
                &job.status.as_str(),
                &job.builder_sandbox_id,
                &job.checker_sandbox_id,
                &job.created_at,
                &job.completed_at,
                &job.error_message,
                &job.review_comment,
            ],
        )
        .await?;
        if let Some(audit) = audit {
            tx.execute(
                "INSERT INTO audit_records (job_id, payload, created_at) \
                 VALUES ($1, $2, $3) ON CONFLICT (job_id) DO NOTHING",
                &[&audit.job_id, &audit.payload, &audit.created_at],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_audit(&self, job_id: Uuid) -> Result<Option<AuditRecord>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT job_id, payload, created_at FROM audit_records WHERE job_id = $1",
                &[&job_id],
            )
            .await?;
        Ok(row.map(|row| AuditRecord {
            job_id: row.get("job_id"),
            payload: row.get("payload"),
            created_at: row.get("created_at"),
        }))
    }
}
