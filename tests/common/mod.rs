//! Shared test doubles: a scriptable sandbox driver, a recording commit
//! gate, and a harness wiring them to a real engine over the in-memory
//! store.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use icarus::config::Config;
use icarus::engine::job::{Job, JobStatus};
use icarus::engine::{EngineConfig, JobEngine};
use icarus::error::VcsError;
use icarus::sandbox::{SandboxDriver, SandboxError, SandboxId, SandboxSpec, SandboxState};
use icarus::sentinel::AdmissionLevel;
use icarus::store::{MemoryStore, Store};
use icarus::vcs::Vcs;
use icarus::workspace::WorkspaceManager;

struct MockSandbox {
    spec: SandboxSpec,
    state: SandboxState,
    log_tx: Option<mpsc::UnboundedSender<String>>,
    log_rx: Option<mpsc::UnboundedReceiver<String>>,
}

/// In-memory sandbox runtime with inspectable call history.
#[derive(Default)]
pub struct MockDriver {
    sandboxes: Mutex<HashMap<String, MockSandbox>>,
    specs: Mutex<Vec<SandboxSpec>>,
    counter: AtomicUsize,
    pub killed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub paused: Mutex<Vec<String>>,
    pub unpaused: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specs of every sandbox ever created, including removed ones.
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn live_handles(&self) -> Vec<String> {
        self.sandboxes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| !matches!(s.state, SandboxState::Exited { .. }))
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Emit a log line from a sandbox, as a worker process would.
    pub fn push_log(&self, handle: &str, line: &str) {
        if let Some(sandbox) = self.sandboxes.lock().unwrap().get(handle)
            && let Some(tx) = &sandbox.log_tx
        {
            let _ = tx.send(line.to_string());
        }
    }
}

#[async_trait]
impl SandboxDriver for MockDriver {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId, SandboxError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = format!("mock-{n}-{}", spec.name);
        self.specs.lock().unwrap().push(spec.clone());
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        self.sandboxes.lock().unwrap().insert(
            handle.clone(),
            MockSandbox {
                spec: spec.clone(),
                state: SandboxState::Running,
                log_tx: Some(log_tx),
                log_rx: Some(log_rx),
            },
        );
        Ok(SandboxId(handle))
    }

    async fn start(&self, id: &SandboxId) -> Result<(), SandboxError> {
        match self.sandboxes.lock().unwrap().get(id.as_str()) {
            Some(_) => Ok(()),
            None => Err(SandboxError::NotFound {
                handle: id.to_string(),
            }),
        }
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxState, SandboxError> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id.as_str())
            .map(|s| s.state)
            .ok_or_else(|| SandboxError::NotFound {
                handle: id.to_string(),
            })
    }

    async fn pause(&self, id: &SandboxId) -> Result<(), SandboxError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(id.as_str())
            .ok_or_else(|| SandboxError::NotFound {
                handle: id.to_string(),
            })?;
        sandbox.state = SandboxState::Paused;
        self.paused.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn unpause(&self, id: &SandboxId) -> Result<(), SandboxError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(id.as_str())
            .ok_or_else(|| SandboxError::NotFound {
                handle: id.to_string(),
            })?;
        sandbox.state = SandboxState::Running;
        self.unpaused.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn kill(&self, id: &SandboxId) -> Result<(), SandboxError> {
        // Idempotent: killing an unknown or dead sandbox succeeds.
        if let Some(sandbox) = self.sandboxes.lock().unwrap().get_mut(id.as_str()) {
            sandbox.state = SandboxState::Exited { exit_code: 137 };
            sandbox.log_tx = None;
        }
        self.killed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.sandboxes.lock().unwrap().remove(id.as_str());
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxId>, SandboxError> {
        Ok(self
            .sandboxes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| {
                s.spec.name.starts_with(prefix)
                    && !matches!(s.state, SandboxState::Exited { .. })
            })
            .map(|(h, _)| SandboxId(h.clone()))
            .collect())
    }

    fn tail_logs(&self, id: &SandboxId) -> BoxStream<'static, String> {
        let rx = self
            .sandboxes
            .lock()
            .unwrap()
            .get_mut(id.as_str())
            .and_then(|s| s.log_rx.take());
        match rx {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }
}

/// Commit gate that records calls and can be told to fail.
#[derive(Default)]
pub struct RecordingVcs {
    pub commits: Mutex<Vec<Uuid>>,
    pub fail_with: Mutex<Option<String>>,
}

#[async_trait]
impl Vcs for RecordingVcs {
    async fn commit(&self, _workspace: &Path, job: &Job) -> Result<(), VcsError> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(VcsError::CommandFailed { message });
        }
        self.commits.lock().unwrap().push(job.id);
        Ok(())
    }
}

/// A running engine over mocks, with its scheduler task live.
pub struct Harness {
    pub engine: Arc<JobEngine>,
    pub store: Arc<MemoryStore>,
    pub driver: Arc<MockDriver>,
    pub vcs: Arc<RecordingVcs>,
    pub level_tx: watch::Sender<AdmissionLevel>,
    _workdir: tempfile::TempDir,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut Config)) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), configure)
    }

    /// Build a harness over a pre-populated store, as a restart would.
    pub fn with_store(store: Arc<MemoryStore>, configure: impl FnOnce(&mut Config)) -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace.base_path = workdir.path().to_path_buf();
        configure(&mut config);

        let driver = Arc::new(MockDriver::new());
        let vcs = Arc::new(RecordingVcs::default());
        let (level_tx, level_rx) = watch::channel(AdmissionLevel::Green);

        let engine = JobEngine::new(
            EngineConfig::from_config(&config),
            store.clone() as Arc<dyn Store>,
            driver.clone(),
            vcs.clone(),
            WorkspaceManager::new(&config.workspace),
            level_rx,
        );
        tokio::spawn(Arc::clone(&engine).run());

        Self {
            engine,
            store,
            driver,
            vcs,
            level_tx,
            _workdir: workdir,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        self._workdir.path()
    }

    pub async fn submit(&self, task: &str) -> Job {
        self.engine
            .submit(task.to_string(), "/tmp/project".to_string())
            .await
            .unwrap()
    }

    /// Poll the store until the job reaches `status` (5 s cap).
    pub async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.store.get_job(id).await.unwrap()
                && job.status == status
            {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for job {id} to reach {status}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// The engine-recorded sandbox handle for the job's current phase.
    /// Polls because the handle is persisted just after the phase
    /// transition, once sandbox creation returns.
    pub async fn current_sandbox(&self, id: Uuid) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.store.get_job(id).await.unwrap()
                && let Some(handle) = job.live_sandbox()
            {
                return handle.to_string();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for job {id} to get a sandbox"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
