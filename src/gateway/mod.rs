//! API gateway: the HTTP and WebSocket surface of the control plane.
//!
//! The gateway is stateless; every operation delegates to the engine or
//! the store. Callbacks are not authenticated here; trust derives from
//! the sandbox network boundary.

pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::engine::JobEngine;
use crate::engine::broadcast::JobEvent;
use crate::engine::callback::WorkerCallback;
use crate::engine::job::JobStatus;
use crate::gateway::types::{
    ApiError, ApproveRequest, ApproveResponse, AuditResponse, CallbackResponse, HealthResponse,
    JobView, ListParams, SpawnRequest, SpawnResponse, TelemetryResponse,
};
use crate::store::Store;

const LIST_LIMIT_DEFAULT: usize = 50;
const LIST_LIMIT_MAX: usize = 200;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobEngine>,
    pub store: Arc<dyn Store>,
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs/spawn", post(spawn_job))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}/status", get(job_status))
        .route("/jobs/{id}/telemetry", get(job_telemetry))
        .route("/jobs/{id}/audit", get(job_audit))
        .route("/jobs/{id}/approve", post(approve_job))
        .route("/jobs/{id}/callback", post(job_callback))
        .route("/jobs/{id}/stream", get(job_stream))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
            tracing::info!("gateway shutting down");
        })
        .await
}

// -- Handlers --

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sentinel_level: state.engine.level(),
        active_jobs: state.engine.active_job_count().await,
    })
}

async fn spawn_job(
    State(state): State<AppState>,
    Json(req): Json<SpawnRequest>,
) -> Result<(StatusCode, Json<SpawnResponse>), ApiError> {
    let job = state.engine.submit(req.task, req.project_path).await?;
    Ok((
        StatusCode::CREATED,
        Json(SpawnResponse {
            job_id: job.id,
            status: job.status,
            message: "job accepted".to_string(),
        }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(LIST_LIMIT_DEFAULT)
        .clamp(1, LIST_LIMIT_MAX);
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let jobs = state.store.list_jobs(limit, status).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::from(crate::error::EngineError::UnknownJob(id)))?;
    Ok(Json(JobView::from(job)))
}

async fn job_telemetry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TelemetryResponse>, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::from(crate::error::EngineError::UnknownJob(id)))?;

    // Zeros until the worker's first heartbeat.
    let sample = state.store.latest_telemetry(id).await?;
    let (cpu, ram, tool) = match sample {
        Some(sample) => {
            let tool = (!sample.current_tool.is_empty()).then_some(sample.current_tool);
            (sample.cpu_percent, sample.ram_mb, tool)
        }
        None => (0.0, 0.0, None),
    };

    Ok(Json(TelemetryResponse {
        job_id: id,
        status: job.status,
        cpu_usage: cpu,
        ram_usage_mb: ram,
        current_tool: tool,
    }))
}

async fn job_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AuditResponse>, ApiError> {
    let record = state
        .store
        .get_audit(id)
        .await?
        .ok_or_else(|| ApiError::from(crate::error::EngineError::UnknownJob(id)))?;
    Ok(Json(AuditResponse {
        job_id: record.job_id,
        audit_report: record.payload,
        created_at: record.created_at,
    }))
}

async fn approve_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let status = state.engine.approve(id, req.approved, req.comment).await?;
    let message = match status {
        JobStatus::Approved => "approved; committing to remote".to_string(),
        _ => "rejected; workspace cleaned up".to_string(),
    };
    Ok(Json(ApproveResponse { message, status }))
}

async fn job_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let callback = WorkerCallback::from_value(payload)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    state.engine.handle_callback(id, callback).await?;
    Ok(Json(CallbackResponse { ok: true }))
}

async fn job_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Reject unknown jobs before upgrading.
    let events = state.engine.subscribe(id).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, events)))
}

/// Pump engine events to one subscriber until the job's channel closes or
/// the client goes away.
async fn forward_events(mut socket: WebSocket, mut events: mpsc::Receiver<JobEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Terminal event already delivered; close after drain.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("unserializable push event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound frames are ignored; the channel is push-only.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
