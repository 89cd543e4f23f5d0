//! Worker callback payloads.
//!
//! The callback endpoint accepts three shapes discriminated by the `status`
//! field: absent means a progress heartbeat, `"completed"` and `"error"`
//! are phase outcomes. Anything else is rejected at the boundary.

use serde::Deserialize;

/// A decoded worker callback.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCallback {
    /// Heartbeat with telemetry and the tool currently running.
    Progress {
        current_tool: Option<String>,
        cpu_usage: Option<f64>,
        ram_usage_mb: Option<f64>,
    },
    /// The phase finished; the checker attaches its audit payload.
    Completed { audit_report: Option<serde_json::Value> },
    /// The phase failed with a worker-supplied message.
    Error { error: String },
}

/// Raw wire shape; the union of all three variants' fields.
#[derive(Debug, Deserialize)]
struct RawCallback {
    status: Option<String>,
    error: Option<String>,
    audit_report: Option<serde_json::Value>,
    current_tool: Option<String>,
    cpu_usage: Option<f64>,
    ram_usage_mb: Option<f64>,
}

/// Why a callback payload was rejected.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CallbackDecodeError {
    #[error("unknown callback status '{0}'")]
    UnknownStatus(String),
    #[error("error callback is missing the 'error' field")]
    MissingError,
}

impl WorkerCallback {
    /// Decode a JSON payload, rejecting unknown shapes.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CallbackDecodeError> {
        let raw: RawCallback = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(_) => {
                return Err(CallbackDecodeError::UnknownStatus("<non-object>".to_string()));
            }
        };

        match raw.status.as_deref() {
            None => Ok(WorkerCallback::Progress {
                current_tool: raw.current_tool,
                cpu_usage: raw.cpu_usage,
                ram_usage_mb: raw.ram_usage_mb,
            }),
            Some("completed") => Ok(WorkerCallback::Completed {
                audit_report: raw.audit_report,
            }),
            Some("error") => match raw.error {
                Some(error) => Ok(WorkerCallback::Error { error }),
                None => Err(CallbackDecodeError::MissingError),
            },
            Some(other) => Err(CallbackDecodeError::UnknownStatus(other.to_string())),
        }
    }
}
