//! The job engine: state machine, scheduler, approval gate, cleanup.
//!
//! One serialized decision loop owns every status transition. It wakes on
//! three events (a new submission, a job leaving its admission slot, a
//! sentinel level change) and greedily admits eligible pending jobs,
//! oldest first. Worker spawning then proceeds concurrently per job.
//!
//! Every transition is persisted before its `status_update` is broadcast,
//! and all transitions funnel through one mutex, so timer-versus-callback
//! races resolve to whichever commits first; the loser is a no-op.

pub mod broadcast;
pub mod callback;
pub mod job;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use uuid::Uuid;

use crate::config::{AgentConfig, Config};
use crate::engine::broadcast::{Broadcaster, JobEvent, terminal_replay};
use crate::engine::callback::WorkerCallback;
use crate::engine::job::{AuditRecord, Job, JobStatus, TelemetrySample};
use crate::error::EngineError;
use crate::sandbox::{MountSpec, SANDBOX_NAME_PREFIX, SandboxDriver, SandboxId, SandboxSpec};
use crate::sentinel::AdmissionLevel;
use crate::store::Store;
use crate::vcs::Vcs;
use crate::workspace::WorkspaceManager;

/// Pipeline phase executed in a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Check,
}

impl Phase {
    /// The job status during this phase.
    fn status(self) -> JobStatus {
        match self {
            Phase::Build => JobStatus::Building,
            Phase::Check => JobStatus::Checking,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Phase::Build => "builder",
            Phase::Check => "checker",
        }
    }
}

/// Engine settings distilled from the loaded `Config`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    pub max_task_bytes: usize,
    pub stream_buffer: usize,
    /// Base URL workers dial back to, e.g. `http://172.17.0.1:8080`.
    pub callback_base: String,
    pub builder: AgentConfig,
    pub checker: AgentConfig,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.orchestrator.max_concurrent_jobs,
            job_timeout: config.orchestrator.job_timeout(),
            max_task_bytes: config.orchestrator.max_task_bytes,
            stream_buffer: config.orchestrator.stream_buffer,
            callback_base: format!(
                "http://{}:{}",
                config.orchestrator.callback_host(),
                config.orchestrator.port
            ),
            builder: config.agents.builder.clone(),
            checker: config.agents.checker.clone(),
        }
    }
}

/// State guarded by the engine mutex: the authoritative in-memory view of
/// non-terminal jobs plus their push-channel fan-out points.
#[derive(Default)]
struct EngineInner {
    jobs: HashMap<Uuid, Job>,
    broadcasters: HashMap<Uuid, Broadcaster>,
}

pub struct JobEngine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    driver: Arc<dyn SandboxDriver>,
    vcs: Arc<dyn Vcs>,
    workspaces: WorkspaceManager,
    level_rx: watch::Receiver<AdmissionLevel>,
    inner: Mutex<EngineInner>,
    scheduler_wake: Notify,
    shutting_down: AtomicBool,
}

impl JobEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        driver: Arc<dyn SandboxDriver>,
        vcs: Arc<dyn Vcs>,
        workspaces: WorkspaceManager,
        level_rx: watch::Receiver<AdmissionLevel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            driver,
            vcs,
            workspaces,
            level_rx,
            inner: Mutex::new(EngineInner::default()),
            scheduler_wake: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Current admission level as seen by the scheduler.
    pub fn level(&self) -> AdmissionLevel {
        *self.level_rx.borrow()
    }

    /// Number of jobs in the engine's active view.
    pub async fn active_job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    // -- Startup recovery --

    /// Reconcile persisted state after a restart. Jobs that were mid-phase
    /// or mid-commit are orphaned by design and transition to `failed`;
    /// pending and awaiting-approval jobs are re-adopted as-is.
    pub async fn recover(&self) -> Result<(), EngineError> {
        let active = self.store.list_active_jobs().await?;
        for persisted in active {
            let id = persisted.id;
            match persisted.status {
                JobStatus::Pending | JobStatus::AwaitingApproval => {
                    tracing::info!(job_id = %id, status = %persisted.status, "re-adopted job");
                    self.inner.lock().await.jobs.insert(id, persisted);
                }
                JobStatus::Building | JobStatus::Checking | JobStatus::Approved => {
                    let failed = {
                        let mut inner = self.inner.lock().await;
                        inner.jobs.insert(id, persisted);
                        self.commit_transition(&mut inner, id, JobStatus::Failed, |job| {
                            job.error_message = Some("orphaned on restart".to_string());
                        })
                        .await?
                    };
                    tracing::warn!(job_id = %id, "orphaned on restart");
                    self.cleanup_terminal(&failed).await;
                }
                _ => {}
            }
        }
        // Re-adopted pending jobs are eligible for admission right away.
        self.scheduler_wake.notify_one();
        Ok(())
    }

    // -- Scheduler loop --

    /// The single serialized decision loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut level_rx = self.level_rx.clone();
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.admit_pending().await;
            tokio::select! {
                _ = self.scheduler_wake.notified() => {}
                changed = level_rx.changed() => {
                    if changed.is_err() {
                        // Sentinel gone; only submit/transition wakes remain.
                        self.scheduler_wake.notified().await;
                    }
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Admit as many eligible pending jobs as slots and the sentinel
    /// permit, oldest first (ties broken by id).
    async fn admit_pending(self: &Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if self.level() == AdmissionLevel::Red {
                return;
            }

            let admitted = {
                let mut inner = self.inner.lock().await;
                let occupied = inner.jobs.values().filter(|j| j.status.holds_slot()).count();
                if occupied >= self.config.max_concurrent_jobs {
                    return;
                }

                let next = inner
                    .jobs
                    .values()
                    .filter(|j| j.status == JobStatus::Pending)
                    .min_by(|a, b| {
                        a.created_at
                            .cmp(&b.created_at)
                            .then(a.id.to_string().cmp(&b.id.to_string()))
                    })
                    .map(|j| j.id);
                let Some(job_id) = next else { return };

                match self
                    .commit_transition(&mut inner, job_id, JobStatus::Building, |_| {})
                    .await
                {
                    Ok(job) => Some(job),
                    Err(e) => {
                        tracing::error!(job_id = %job_id, "admission failed: {}", e);
                        return;
                    }
                }
            };

            if let Some(job) = admitted {
                tracing::info!(job_id = %job.id, "admitted");
                self.arm_job_timer(job.id);
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.launch_phase(job.id, Phase::Build).await;
                });
            }
        }
    }

    // -- Submission --

    pub async fn submit(&self, task: String, project_path: String) -> Result<Job, EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        if task.is_empty() {
            return Err(EngineError::InvalidTask {
                reason: "task must not be empty".to_string(),
            });
        }
        if task.len() > self.config.max_task_bytes {
            return Err(EngineError::InvalidTask {
                reason: format!(
                    "task exceeds {} bytes (got {})",
                    self.config.max_task_bytes,
                    task.len()
                ),
            });
        }

        let job = Job::new(task, project_path);
        {
            let mut inner = self.inner.lock().await;
            self.store.save_job(&job).await?;
            inner.jobs.insert(job.id, job.clone());
            inner
                .broadcasters
                .insert(job.id, Broadcaster::new(self.config.stream_buffer));
        }
        tracing::info!(job_id = %job.id, "job submitted");
        self.scheduler_wake.notify_one();
        Ok(job)
    }

    // -- Phase execution --

    async fn launch_phase(self: Arc<Self>, job_id: Uuid, phase: Phase) {
        let workspace = match self.workspaces.provision(job_id).await {
            Ok(path) => path,
            Err(e) => {
                self.fail_job(job_id, format!("workspace provisioning failed: {e}"))
                    .await;
                return;
            }
        };

        let spec = {
            let inner = self.inner.lock().await;
            let Some(job) = inner.jobs.get(&job_id) else {
                return;
            };
            if job.status != phase.status() {
                return;
            }
            self.sandbox_spec(job, phase, &workspace)
        };

        let handle = match self.driver.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_job(job_id, format!("sandbox create failed: {e}"))
                    .await;
                return;
            }
        };

        // Record the handle while the job is still in this phase. If the
        // job failed meanwhile (outer timeout, shutdown) the fresh sandbox
        // is an orphan and is torn down instead.
        let recorded = {
            let mut inner = self.inner.lock().await;
            match inner.jobs.get_mut(&job_id) {
                Some(job) if job.status == phase.status() => {
                    match phase {
                        Phase::Build => job.builder_sandbox_id = Some(handle.0.clone()),
                        Phase::Check => job.checker_sandbox_id = Some(handle.0.clone()),
                    }
                    let snapshot = job.clone();
                    Some(self.store.save_job(&snapshot).await)
                }
                _ => None,
            }
        };
        match recorded {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.fail_job(job_id, format!("persisting sandbox handle failed: {e}"))
                    .await;
                return;
            }
            None => {
                let _ = self.driver.kill(&handle).await;
                let _ = self.driver.remove(&handle).await;
                return;
            }
        }

        if let Err(e) = self.driver.start(&handle).await {
            self.fail_job(job_id, format!("sandbox start failed: {e}"))
                .await;
            return;
        }
        tracing::info!(job_id = %job_id, sandbox = %handle, phase = ?phase, "sandbox started");

        // Forward the sandbox's log lines onto the push channel. The
        // stream ends when the sandbox exits or is removed.
        let engine = Arc::clone(&self);
        let mut logs = self.driver.tail_logs(&handle);
        tokio::spawn(async move {
            while let Some(line) = logs.next().await {
                engine.publish_log(job_id, line).await;
            }
        });

        // Phase deadline. The timer always fires; if the phase already
        // completed, its attempt is rejected by the status check.
        let engine = Arc::clone(&self);
        let deadline = self.agent_config(phase).timeout();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            engine.phase_timeout(job_id, phase).await;
        });
    }

    fn arm_job_timer(self: &Arc<Self>, job_id: Uuid) {
        let engine = Arc::clone(self);
        let timeout = self.config.job_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.job_timeout_fired(job_id).await;
        });
    }

    async fn phase_timeout(&self, job_id: Uuid, phase: Phase) {
        let still_in_phase = {
            let inner = self.inner.lock().await;
            inner
                .jobs
                .get(&job_id)
                .is_some_and(|j| j.status == phase.status())
        };
        if still_in_phase {
            tracing::warn!(job_id = %job_id, phase = ?phase, "phase deadline exceeded");
            self.fail_job(job_id, "phase timeout").await;
        }
    }

    async fn job_timeout_fired(&self, job_id: Uuid) {
        let expired = {
            let inner = self.inner.lock().await;
            // The approval gate has no timeout: a job may sit in
            // awaiting_approval indefinitely.
            inner.jobs.get(&job_id).is_some_and(|j| {
                matches!(
                    j.status,
                    JobStatus::Building | JobStatus::Checking | JobStatus::Approved
                )
            })
        };
        if expired {
            tracing::warn!(job_id = %job_id, "job wall-time cap exceeded");
            self.fail_job(job_id, "job timeout").await;
        }
    }

    // -- Worker callbacks --

    /// Ingest one worker callback. Unknown jobs error; callbacks for jobs
    /// not in a sandbox-awaiting status are discarded.
    pub async fn handle_callback(
        self: &Arc<Self>,
        job_id: Uuid,
        callback: WorkerCallback,
    ) -> Result<(), EngineError> {
        match callback {
            WorkerCallback::Progress {
                current_tool,
                cpu_usage,
                ram_usage_mb,
            } => {
                let status = self.job_status(job_id).await?;
                if !status.awaits_sandbox() {
                    tracing::debug!(job_id = %job_id, status = %status, "discarding progress callback");
                    return Ok(());
                }
                let sample = TelemetrySample {
                    job_id,
                    recorded_at: Utc::now(),
                    cpu_percent: cpu_usage.unwrap_or(0.0).clamp(0.0, 100.0),
                    ram_mb: ram_usage_mb.unwrap_or(0.0).max(0.0),
                    current_tool: current_tool.clone().unwrap_or_default(),
                };
                self.store.append_telemetry(&sample).await?;
                if let Some(tool) = current_tool
                    && !tool.is_empty()
                {
                    self.publish_log(job_id, format!("tool: {tool}")).await;
                }
                Ok(())
            }
            WorkerCallback::Completed { audit_report } => {
                self.handle_phase_complete(job_id, audit_report).await
            }
            WorkerCallback::Error { error } => {
                let status = self.job_status(job_id).await?;
                if status.awaits_sandbox() {
                    self.fail_job(job_id, error).await;
                } else {
                    tracing::debug!(job_id = %job_id, status = %status, "discarding error callback");
                }
                Ok(())
            }
        }
    }

    async fn handle_phase_complete(
        self: &Arc<Self>,
        job_id: Uuid,
        audit_report: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        enum Next {
            StartCheck { released: Option<String> },
            AwaitApproval { released: Option<String> },
            Discard(JobStatus),
        }

        let next = {
            let mut inner = self.inner.lock().await;
            let current = inner
                .jobs
                .get(&job_id)
                .map(|j| (j.status, j.builder_sandbox_id.clone(), j.checker_sandbox_id.clone()));

            match current {
                None => None,
                Some((JobStatus::Building, released, _)) => {
                    self.commit_transition(&mut inner, job_id, JobStatus::Checking, |j| {
                        j.builder_sandbox_id = None;
                    })
                    .await?;
                    Some(Next::StartCheck { released })
                }
                Some((JobStatus::Checking, _, released)) => {
                    let audit = audit_report.map(|payload| AuditRecord {
                        job_id,
                        payload,
                        created_at: Utc::now(),
                    });
                    self.commit_transition_with_audit(
                        &mut inner,
                        job_id,
                        JobStatus::AwaitingApproval,
                        |j| {
                            j.checker_sandbox_id = None;
                        },
                        audit,
                    )
                    .await?;
                    Some(Next::AwaitApproval { released })
                }
                Some((status, _, _)) => Some(Next::Discard(status)),
            }
        };

        let Some(next) = next else {
            // Known but no longer active (terminal): idempotent no-op.
            return match self.store.get_job(job_id).await? {
                Some(job) => {
                    tracing::debug!(job_id = %job_id, status = %job.status, "discarding completion callback");
                    Ok(())
                }
                None => Err(EngineError::UnknownJob(job_id)),
            };
        };

        match next {
            Next::StartCheck { released } => {
                self.release_sandbox(released).await;
                tracing::info!(job_id = %job_id, "build complete, starting check");
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.launch_phase(job_id, Phase::Check).await;
                });
            }
            Next::AwaitApproval { released } => {
                self.release_sandbox(released).await;
                tracing::info!(job_id = %job_id, "check complete, awaiting approval");
            }
            Next::Discard(status) => {
                tracing::debug!(job_id = %job_id, status = %status, "discarding completion callback");
            }
        }
        Ok(())
    }

    // -- Approval gate --

    /// Resolve the approval gate. Only legal in `awaiting_approval`.
    pub async fn approve(
        self: &Arc<Self>,
        job_id: Uuid,
        approved: bool,
        comment: Option<String>,
    ) -> Result<JobStatus, EngineError> {
        let mut inner = self.inner.lock().await;
        let current = inner.jobs.get(&job_id).map(|j| j.status);
        let Some(status) = current else {
            drop(inner);
            return match self.store.get_job(job_id).await? {
                Some(job) => Err(EngineError::Conflict {
                    job_id,
                    status: job.status,
                    required: "awaiting_approval",
                }),
                None => Err(EngineError::UnknownJob(job_id)),
            };
        };
        if status != JobStatus::AwaitingApproval {
            return Err(EngineError::Conflict {
                job_id,
                status,
                required: "awaiting_approval",
            });
        }

        if approved {
            self.commit_transition(&mut inner, job_id, JobStatus::Approved, |j| {
                j.review_comment = comment;
            })
            .await?;
            drop(inner);
            tracing::info!(job_id = %job_id, "approved, committing");
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.run_commit(job_id).await;
            });
            Ok(JobStatus::Approved)
        } else {
            let job = self
                .commit_transition(&mut inner, job_id, JobStatus::Rejected, |j| {
                    j.review_comment = comment;
                })
                .await?;
            drop(inner);
            tracing::info!(job_id = %job_id, "rejected");
            self.cleanup_terminal(&job).await;
            Ok(JobStatus::Rejected)
        }
    }

    async fn run_commit(&self, job_id: Uuid) {
        let snapshot = {
            let inner = self.inner.lock().await;
            inner.jobs.get(&job_id).cloned()
        };
        let Some(job) = snapshot else { return };
        if job.status != JobStatus::Approved {
            return;
        }

        let workspace = self.workspaces.path_for(job_id);
        match self.vcs.commit(&workspace, &job).await {
            Ok(()) => {
                let completed = {
                    let mut inner = self.inner.lock().await;
                    self.commit_transition(&mut inner, job_id, JobStatus::Completed, |_| {})
                        .await
                };
                match completed {
                    Ok(job) => {
                        tracing::info!(job_id = %job_id, "commit pushed, job completed");
                        self.cleanup_terminal(&job).await;
                    }
                    Err(e) => {
                        tracing::debug!(job_id = %job_id, "completion transition skipped: {}", e);
                    }
                }
            }
            Err(e) => {
                self.fail_job(job_id, e.to_string()).await;
            }
        }
    }

    // -- Failure and cleanup --

    /// Transition a job to `failed` if its current status permits, then
    /// tear down its sandbox and workspace. Illegal edges are no-ops, which
    /// is what makes duplicate failure attempts and timer races safe.
    pub async fn fail_job(&self, job_id: Uuid, message: impl Into<String>) {
        let message = message.into();
        let failed = {
            let mut inner = self.inner.lock().await;
            self.commit_transition(&mut inner, job_id, JobStatus::Failed, |job| {
                job.error_message = Some(message.clone());
            })
            .await
        };
        match failed {
            Ok(job) => {
                tracing::warn!(job_id = %job_id, "job failed: {}", message);
                self.cleanup_terminal(&job).await;
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, "failure attempt was a no-op: {}", e);
            }
        }
    }

    async fn cleanup_terminal(&self, job: &Job) {
        for handle in [&job.builder_sandbox_id, &job.checker_sandbox_id]
            .into_iter()
            .flatten()
        {
            self.release_sandbox(Some(handle.clone())).await;
        }
        if matches!(job.status, JobStatus::Failed | JobStatus::Rejected) {
            self.workspaces.destroy(job.id).await;
        }
    }

    async fn release_sandbox(&self, handle: Option<String>) {
        let Some(handle) = handle else { return };
        let id = SandboxId(handle);
        if let Err(e) = self.driver.kill(&id).await {
            tracing::warn!(sandbox = %id, "kill failed: {}", e);
        }
        if let Err(e) = self.driver.remove(&id).await {
            tracing::warn!(sandbox = %id, "remove failed: {}", e);
        }
    }

    // -- Shutdown --

    /// Stop admitting, fail in-flight phases, tear down their sandboxes.
    /// Pending and awaiting-approval jobs stay persisted for the next run.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.scheduler_wake.notify_one();

        let in_flight: Vec<Uuid> = {
            let inner = self.inner.lock().await;
            inner
                .jobs
                .values()
                .filter(|j| j.status.awaits_sandbox() || j.status == JobStatus::Approved)
                .map(|j| j.id)
                .collect()
        };
        for job_id in in_flight {
            self.fail_job(job_id, "shutting down").await;
        }
        tracing::info!("engine shut down");
    }

    // -- Push channel --

    /// Attach a subscriber to a job's push channel. Jobs already terminal
    /// replay their terminal status and close.
    pub async fn subscribe(
        &self,
        job_id: Uuid,
    ) -> Result<mpsc::Receiver<JobEvent>, EngineError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.jobs.contains_key(&job_id) {
                let buffer = self.config.stream_buffer;
                let broadcaster = inner
                    .broadcasters
                    .entry(job_id)
                    .or_insert_with(|| Broadcaster::new(buffer));
                return Ok(broadcaster.subscribe());
            }
        }
        match self.store.get_job(job_id).await? {
            Some(job) => Ok(terminal_replay(job.status, self.config.stream_buffer)),
            None => Err(EngineError::UnknownJob(job_id)),
        }
    }

    async fn publish_log(&self, job_id: Uuid, message: String) {
        let mut inner = self.inner.lock().await;
        if let Some(broadcaster) = inner.broadcasters.get_mut(&job_id) {
            broadcaster.publish(JobEvent::Log { message });
        }
    }

    // -- Internals --

    async fn job_status(&self, job_id: Uuid) -> Result<JobStatus, EngineError> {
        {
            let inner = self.inner.lock().await;
            if let Some(job) = inner.jobs.get(&job_id) {
                return Ok(job.status);
            }
        }
        match self.store.get_job(job_id).await? {
            Some(job) => Ok(job.status),
            None => Err(EngineError::UnknownJob(job_id)),
        }
    }

    async fn commit_transition(
        &self,
        inner: &mut EngineInner,
        job_id: Uuid,
        to: JobStatus,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job, EngineError> {
        self.commit_transition_with_audit(inner, job_id, to, mutate, None)
            .await
    }

    /// The one place a status changes: validate the edge, persist (with the
    /// audit record when the check phase completes), update the in-memory
    /// view, then broadcast. Persist always precedes broadcast.
    async fn commit_transition_with_audit(
        &self,
        inner: &mut EngineInner,
        job_id: Uuid,
        to: JobStatus,
        mutate: impl FnOnce(&mut Job),
        audit: Option<AuditRecord>,
    ) -> Result<Job, EngineError> {
        let Some(current) = inner.jobs.get(&job_id) else {
            return Err(EngineError::UnknownJob(job_id));
        };
        let from = current.status;
        if !from.can_transition(to) {
            return Err(EngineError::IllegalTransition { job_id, from, to });
        }

        let mut updated = current.clone();
        updated.status = to;
        mutate(&mut updated);
        if to.is_terminal() {
            updated.completed_at = Some(Utc::now());
        }

        if audit.is_some() {
            self.store.complete_check(&updated, audit.as_ref()).await?;
        } else {
            self.store.save_job(&updated).await?;
        }

        let buffer = self.config.stream_buffer;
        let broadcaster = inner
            .broadcasters
            .entry(job_id)
            .or_insert_with(|| Broadcaster::new(buffer));
        if to.is_terminal() {
            broadcaster.publish_terminal(to);
            inner.broadcasters.remove(&job_id);
            inner.jobs.remove(&job_id);
        } else {
            broadcaster.publish(JobEvent::StatusUpdate { status: to });
            inner.jobs.insert(job_id, updated.clone());
        }

        tracing::debug!(job_id = %job_id, from = %from, to = %to, "status transition");
        if from.holds_slot() && !to.holds_slot() {
            self.scheduler_wake.notify_one();
        }
        Ok(updated)
    }

    fn agent_config(&self, phase: Phase) -> &AgentConfig {
        match phase {
            Phase::Build => &self.config.builder,
            Phase::Check => &self.config.checker,
        }
    }

    fn sandbox_spec(&self, job: &Job, phase: Phase, workspace: &Path) -> SandboxSpec {
        let agent = self.agent_config(phase);

        let mut env = HashMap::new();
        env.insert("JOB_ID".to_string(), job.id.to_string());
        env.insert("TASK".to_string(), job.task.clone());
        env.insert(
            "ORCHESTRATOR_CALLBACK".to_string(),
            format!("{}/jobs/{}/callback", self.config.callback_base, job.id),
        );
        for name in &agent.pass_env {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), value);
            }
        }

        SandboxSpec {
            image: agent.image_name.clone(),
            cpu_limit: agent.cpu_limit,
            memory_limit_bytes: agent.memory_limit,
            env,
            mount: MountSpec {
                source: PathBuf::from(workspace),
                read_only: phase == Phase::Check,
            },
            network_mode: agent.network_mode.clone(),
            name: format!(
                "{}{}_{}",
                SANDBOX_NAME_PREFIX,
                job.id.simple(),
                phase.suffix()
            ),
        }
    }
}
