use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::common::response::ApiError;
use crate::infrastructure::queue::BusError;
use crate::infrastructure::storage::StorageError;
use crate::modules::uploads::repository::RegistryError;
use crate::workers::encoder::EncodeError;

/// Failure taxonomy shared by the HTTP surface and the asynchronous pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("transfer failed: {0}")]
    Io(String),

    #[error("encoder failed: {0}")]
    EncodeFailed(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("event bus error: {0}")]
    Bus(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::MalformedEvent(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::StorageUnavailable(_) | AppError::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Io(_) | AppError::EncodeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        ApiError(self.to_string(), status).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => AppError::NotFound(key),
            StorageError::Io(e) => AppError::Io(e.to_string()),
            StorageError::Transfer(msg) => AppError::Io(msg),
            StorageError::Backend(msg) | StorageError::Presign(msg) => {
                AppError::StorageUnavailable(msg)
            }
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(what) => AppError::NotFound(what),
            RegistryError::Conflict(msg) => AppError::Conflict(msg),
            RegistryError::Unavailable(msg) => AppError::StorageUnavailable(msg),
        }
    }
}

impl From<BusError> for AppError {
    fn from(e: BusError) -> Self {
        AppError::Bus(e.to_string())
    }
}

impl From<EncodeError> for AppError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Io(e) => AppError::Io(e.to_string()),
            other => AppError::EncodeFailed(other.to_string()),
        }
    }
}
