//! Wire shapes for the HTTP surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::job::{Job, JobStatus};
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
pub struct SpawnRequest {
    pub task: String,
    pub project_path: String,
}

#[derive(Debug, Serialize)]
pub struct SpawnResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub status: Option<String>,
}

/// Job view returned by `/jobs` and `/jobs/{id}/status`.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub task: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            task: job.task,
            created_at: job.created_at,
            completed_at: job.completed_at,
            error_message: job.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cpu_usage: f64,
    pub ram_usage_mb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub job_id: Uuid,
    pub audit_report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approved: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub message: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sentinel_level: crate::sentinel::AdmissionLevel,
    pub active_jobs: usize,
}

/// Gateway-level error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::UnknownJob(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict { .. } | EngineError::IllegalTransition { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::InvalidTask { .. } => StatusCode::BAD_REQUEST,
            EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<crate::error::StoreError> for ApiError {
    fn from(e: crate::error::StoreError) -> Self {
        ApiError::from(EngineError::Store(e))
    }
}
