//! Application error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::plugin::PluginError;

/// Application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Unprocessable(String),
}

impl From<PluginError> for AppError {
    fn from(e: PluginError) -> Self {
        let message = e.to_string();
        match e {
            PluginError::NotRegistered { .. }
            | PluginError::CatalogEntryNotFound { .. }
            | PluginError::DescriptorMissing { .. } => AppError::NotFound(message),

            PluginError::AlreadyActive { .. }
            | PluginError::AlreadyInactive { .. }
            | PluginError::NotActive { .. }
            | PluginError::PluginActive { .. }
            | PluginError::OutOfSync { .. }
            | PluginError::DuplicatePluginName { .. }
            | PluginError::NameMismatch { .. }
            | PluginError::SchemaNameConflict { .. } => AppError::Conflict(message),

            PluginError::InvalidCatalogId { .. } => AppError::BadRequest(message),

            PluginError::DescriptorMalformed { .. }
            | PluginError::PluginMissingOnDisk { .. }
            | PluginError::EntryPointMissing { .. }
            | PluginError::PluginSyntaxError { .. }
            | PluginError::PluginImportError { .. }
            | PluginError::ContractViolation { .. }
            | PluginError::UnsupportedArchiveType { .. }
            | PluginError::MigrationFailed { .. } => AppError::Unprocessable(message),

            PluginError::Storage(e) => AppError::Internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };

        // Internal details go to the log, not the client
        let detail = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "internal server error");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;
