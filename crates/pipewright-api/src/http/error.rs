//! Application error type mapping engine errors to HTTP status codes and the
//! envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pipewright_core::error::EngineError;
use pipewright_types::error::RepositoryError;

use crate::http::response::ApiResponse;

#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    /// Malformed request (missing tenant header, bad path or body).
    BadRequest(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Engine(e.into())
    }
}

/// HTTP status for an engine error kind.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) | EngineError::StaleWrite { .. } | EngineError::Cancelled => StatusCode::CONFLICT,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::InvalidResume { .. } | EngineError::QualityThresholdNotMet { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::TenantIsolationViolation { .. } => StatusCode::FORBIDDEN,
        EngineError::ResourceBudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        EngineError::TransientExecution { .. } | EngineError::UnitFailed { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::CheckpointCorruption { .. } | EngineError::Unrecoverable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            AppError::Engine(e) => {
                let details = match e {
                    EngineError::InvalidResume { expected, received, .. } => Some(serde_json::json!({
                        "expected": expected,
                        "received": received,
                    })),
                    EngineError::ResourceBudgetExceeded { remaining, .. } => {
                        Some(serde_json::json!({ "remaining": remaining }))
                    }
                    _ => None,
                };
                (status_for(e), e.kind().to_uppercase(), e.to_string(), details)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST".to_string(), msg.clone(), None),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR".to_string(),
                msg.clone(),
                None,
            ),
        };

        if status.is_server_error() {
            tracing::error!(code = %code, error = %message, "request failed");
        }

        let body = ApiResponse::error(&code, message, details, uuid::Uuid::now_v7().to_string());
        (status, Json(body)).into_response()
    }
}
