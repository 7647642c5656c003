//! Error types and handling
//!
//! Each subsystem has its own error enum; `AppError` aggregates them at the
//! command layer.

use crate::config::ConfigError;
use crate::models::StoreError;
use crate::recorder::RecorderError;
use crate::tasks::RetentionError;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecorderError),

    #[error("Model store error: {0}")]
    Store(#[from] StoreError),

    #[error("Retention error: {0}")]
    Retention(#[from] RetentionError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Stable machine-readable code, used in JSON output
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Recording(RecorderError::DuplicateActiveSession { .. }) => {
                "DUPLICATE_ACTIVE_SESSION"
            }
            AppError::Recording(RecorderError::ProcessSpawnFailure { .. }) => {
                "PROCESS_SPAWN_FAILURE"
            }
            AppError::Recording(RecorderError::ShuttingDown { .. }) => "SHUTTING_DOWN",
            AppError::Recording(_) => "RECORDING_ERROR",
            AppError::Store(_) => "STORE_ERROR",
            AppError::Retention(_) => "RETENTION_DELETE_FAILURE",
            AppError::Http(_) => "HTTP_ERROR",
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
