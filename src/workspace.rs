//! Per-job workspace volumes.
//!
//! Each job gets an isolated directory under `workspace.base_path`, bind
//! mounted into its sandboxes at `/workspace`. Completed jobs keep their
//! workspace (the contents are the delivered artifact); rejected and
//! failed jobs have theirs destroyed.

use std::path::PathBuf;

use uuid::Uuid;

use crate::config::WorkspaceConfig;

/// Creates and destroys workspace directories.
#[derive(Clone)]
pub struct WorkspaceManager {
    base_path: PathBuf,
}

impl WorkspaceManager {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
        }
    }

    /// Host path of a job's workspace.
    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.base_path.join(job_id.to_string())
    }

    /// Create the workspace directory, returning its host path.
    pub async fn provision(&self, job_id: Uuid) -> std::io::Result<PathBuf> {
        let path = self.path_for(job_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Remove the workspace and everything in it.
    pub async fn destroy(&self, job_id: Uuid) {
        let path = self.path_for(job_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => tracing::debug!(job_id = %job_id, "workspace destroyed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id = %job_id, "workspace cleanup failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> WorkspaceManager {
        WorkspaceManager::new(&WorkspaceConfig {
            base_path: dir.to_path_buf(),
            mount_type: "bind".to_string(),
        })
    }

    #[tokio::test]
    async fn provision_then_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let job_id = Uuid::new_v4();

        let path = manager.provision(job_id).await.unwrap();
        assert!(path.is_dir());

        tokio::fs::write(path.join("artifact.txt"), b"x").await.unwrap();
        manager.destroy(job_id).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        // Destroying a workspace that was never provisioned is fine.
        manager.destroy(Uuid::new_v4()).await;
    }
}
