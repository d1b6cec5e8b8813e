//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::pipeline::SubmitError;
use crate::tiles::TileError;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::InvalidSourceId(id) => {
                AppError::Validation(format!("invalid scene identifier: {id}"))
            },
            SubmitError::Ledger(e) => AppError::Ledger(e),
        }
    }
}

impl From<TileError> for AppError {
    fn from(err: TileError) -> Self {
        match err {
            TileError::NotFound(what) => AppError::NotFound(what),
            TileError::BadCoordinates => {
                AppError::BadRequest("tile coordinates out of range".to_string())
            },
            TileError::Unsupported(msg) => AppError::Validation(msg),
            TileError::Backend(msg) => AppError::Internal(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Ledger(ref e) => {
                tracing::error!("Ledger error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Validation(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            },
            AppError::Unauthorized(ref message) => (StatusCode::UNAUTHORIZED, message.clone()),
            AppError::Forbidden(ref message) => (StatusCode::FORBIDDEN, message.clone()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
