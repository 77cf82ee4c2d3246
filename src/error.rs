//! Error handling module
//!
//! Provides the unified error type for the snapshot store, the diff engine
//! and the HTTP surface.

use axum::{
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid qualified key: {0}")]
    InvalidKey(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Diff run {diff_run_id} failed: {reason}")]
    RunFailed { diff_run_id: Uuid, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "diffRunId", skip_serializing_if = "Option::is_none")]
    pub diff_run_id: Option<Uuid>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut diff_run = None;
        let (status, error_code, message, details) = match &self {
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Database connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Serialization(e) => {
                error!("Serialization error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SERIALIZATION_ERROR",
                    "Failed to encode or decode a stored payload".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::InvalidKey(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_KEY",
                msg.clone(),
                None,
            ),
            AppError::Precondition(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "PRECONDITION_FAILED",
                msg.clone(),
                None,
            ),
            AppError::UnknownConnection(msg) => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_CONNECTION",
                format!("Unknown connection: {}", msg),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                msg.clone(),
                None,
            ),
            AppError::InvalidTransition(msg) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                msg.clone(),
                None,
            ),
            AppError::DataIntegrity(msg) => {
                error!("Data integrity violation: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "DATA_INTEGRITY",
                    msg.clone(),
                    None,
                )
            }
            AppError::RunFailed { diff_run_id, reason } => {
                diff_run = Some(*diff_run_id);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DIFF_RUN_FAILED",
                    "The comparison did not complete".to_string(),
                    Some(reason.clone()),
                )
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
            diff_run_id: diff_run,
        });

        (status, body).into_response()
    }
}

/// Result type alias for store, engine and API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

/// Helper function to create a precondition error
pub fn precondition_error(msg: impl Into<String>) -> AppError {
    AppError::Precondition(msg.into())
}
