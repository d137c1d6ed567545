use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("source '{source_name}' failed to export: {detail}")]
    SourceExport { source_name: String, detail: String },

    #[error("archive for backup {backup_id} is corrupt: {detail}")]
    ArchiveCorrupt { backup_id: String, detail: String },

    #[error("source '{source_name}' failed to stage: {detail}")]
    Staging { source_name: String, detail: String },

    #[error("source '{source_name}' failed to swap: {detail}")]
    Swap { source_name: String, detail: String },

    #[error("FATAL: system left inconsistent across sources: {detail}")]
    FatalInconsistency { detail: String },

    #[error("another backup or restore operation is in progress")]
    Busy,

    #[error("{0}")]
    RetentionViolation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// True for every error class the caller may safely retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EngineError::FatalInconsistency { .. })
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            EngineError::SourceExport { .. } | EngineError::Staging { .. } => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            EngineError::ArchiveCorrupt { .. } => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            EngineError::Swap { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            EngineError::FatalInconsistency { detail } => {
                tracing::error!(detail = %detail, "FATAL INCONSISTENCY: operator intervention required");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            EngineError::Busy => (StatusCode::CONFLICT, self.to_string()),
            EngineError::RetentionViolation(m) => (StatusCode::CONFLICT, m.clone()),
            EngineError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            EngineError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            EngineError::Cancelled => (StatusCode::CONFLICT, self.to_string()),
            EngineError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
