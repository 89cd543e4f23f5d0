//! The `Job` record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
///
/// ```text
/// pending -> building -> checking -> awaiting_approval -> approved -> completed
///    |          |           |                |               |
///    v          v           v                v               v
///  failed     failed      failed          rejected         failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Building,
    Checking,
    AwaitingApproval,
    Approved,
    Completed,
    Failed,
    Rejected,
}

impl JobStatus {
    /// True for statuses that never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Rejected)
    }

    /// True for statuses that occupy an admission slot: everything from
    /// admission until terminal. A job waiting at the approval gate keeps
    /// its slot so queued work cannot race the reviewer.
    pub fn holds_slot(self) -> bool {
        !matches!(self, JobStatus::Pending) && !self.is_terminal()
    }

    /// True while the job is waiting on a sandbox callback.
    pub fn awaits_sandbox(self) -> bool {
        matches!(self, JobStatus::Building | JobStatus::Checking)
    }

    /// Whether the edge `self -> next` exists in the transition table.
    pub fn can_transition(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Failed)
                | (Building, Checking)
                | (Building, Failed)
                | (Checking, AwaitingApproval)
                | (Checking, Failed)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Completed)
                | (Approved, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Building => "building",
            JobStatus::Checking => "checking",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Approved => "approved",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "building" => Ok(JobStatus::Building),
            "checking" => Ok(JobStatus::Checking),
            "awaiting_approval" => Ok(JobStatus::AwaitingApproval),
            "approved" => Ok(JobStatus::Approved),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "rejected" => Ok(JobStatus::Rejected),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// One submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task: String,
    pub project_path: String,
    pub status: JobStatus,
    pub builder_sandbox_id: Option<String>,
    pub checker_sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub review_comment: Option<String>,
}

impl Job {
    pub fn new(task: String, project_path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            project_path,
            status: JobStatus::Pending,
            builder_sandbox_id: None,
            checker_sandbox_id: None,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
            review_comment: None,
        }
    }

    /// The sandbox handle for the current phase, if any.
    pub fn live_sandbox(&self) -> Option<&str> {
        self.builder_sandbox_id
            .as_deref()
            .or(self.checker_sandbox_id.as_deref())
    }
}

/// One worker heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub job_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub ram_mb: f64,
    pub current_tool: String,
}

/// The checker's audit payload, stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
