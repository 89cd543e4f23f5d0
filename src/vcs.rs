//! The commit gate behind human approval.
//!
//! Once a reviewer approves a job, the engine pushes the workspace
//! contents to the version-control remote through this interface. The
//! engine only cares about success or the remote's error message.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;

use crate::engine::job::Job;
use crate::error::VcsError;

/// Commit-and-push capability.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Commit the workspace contents for an approved job and push them to
    /// the configured remote.
    async fn commit(&self, workspace: &Path, job: &Job) -> Result<(), VcsError>;
}

/// `Vcs` implementation shelling out to the `git` binary.
pub struct GitCli;

impl GitCli {
    async fn run(&self, workspace: &Path, args: &[&str]) -> Result<(), VcsError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(VcsError::CommandFailed {
            message: format!("git {} failed: {}", args.first().unwrap_or(&""), detail),
        })
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn commit(&self, workspace: &Path, job: &Job) -> Result<(), VcsError> {
        let summary: String = job.task.chars().take(72).collect();
        let message = format!("icarus: {summary}\n\njob: {}", job.id);

        self.run(workspace, &["add", "-A"]).await?;
        self.run(workspace, &["commit", "-m", &message]).await?;
        self.run(workspace, &["push"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::job::Job;

    #[tokio::test]
    async fn commit_outside_a_repo_reports_the_git_message() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new("add a feature".to_string(), "p".to_string());

        let err = GitCli.commit(dir.path(), &job).await.unwrap_err();
        match err {
            VcsError::CommandFailed { message } => {
                assert!(message.contains("git"), "unexpected message: {message}");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
