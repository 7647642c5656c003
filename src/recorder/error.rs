//! Recorder error types

use super::state::SessionId;
use std::io;
use thiserror::Error;

/// Errors raised by the session registry
#[derive(Error, Debug)]
pub enum RecorderError {
    /// A session is already running for this identity; nothing was spawned
    #[error("a session is already running for '{identity}' ({existing})")]
    DuplicateActiveSession {
        identity: String,
        existing: SessionId,
    },

    /// The encoder process could not be launched
    #[error("failed to start {program} for '{identity}': {source}")]
    ProcessSpawnFailure {
        identity: String,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid identity '{0}': use lowercase letters, digits, '-' or '_'")]
    InvalidIdentity(String),

    /// The session was stopped while its encoder was still being launched
    #[error("start of '{identity}' was aborted by a stop request")]
    StartAborted { identity: String },

    /// The registry is shutting down and accepts no new sessions
    #[error("recorder is shutting down, not starting '{identity}'")]
    ShuttingDown { identity: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RecorderError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, RecorderError::DuplicateActiveSession { .. })
    }
}

pub type RecorderResult<T> = Result<T, RecorderError>;
