//! Recording state management
//!
//! Defines the per-session state machine and the snapshot type handed out by
//! the registry.
//!
//! ```text
//!   from \ to   Starting  Running  Stopping  Stopped  Failed
//!   Starting       -         x                  x       x
//!   Running                  -        x         x       x
//!   Stopping                          -         x       x
//!   Stopped                                     -
//!   Failed                                              -
//! ```
//!
//! `Running -> Stopped` happens when the encoder exits on its own (pipe EOF).
//! `Starting -> Stopped` covers the same exit racing the end of the launch.
//! `Stopped` and `Failed` are terminal.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque random session identifier.
///
/// Generated from a v4 UUID, so ids never collide across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Short suffix used in archive file names
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Directories created, encoder being launched
    Starting,
    /// Encoder running and writer thread copying bytes
    Running,
    /// Stop requested, waiting for encoder and writer
    Stopping,
    /// Ended cleanly (stopped or encoder exited)
    Stopped,
    /// Spawn failure or archive write failure
    Failed,
}

impl SessionState {
    /// Whether `self -> next` is an edge of the transition table
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared, guarded state cell.
///
/// All transitions go through [`StateCell::transition`], which refuses edges
/// that are not in the table above.
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<SessionState>,
}

impl StateCell {
    pub fn new(initial: SessionState) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.inner.lock()
    }

    /// Apply `next` if allowed. Returns the previous state on success.
    pub fn transition(&self, next: SessionState) -> Option<SessionState> {
        let mut state = self.inner.lock();
        let prev = *state;
        if prev.can_transition_to(next) {
            *state = next;
            Some(prev)
        } else {
            None
        }
    }

    /// Move to `Stopped` unless the session already ended as `Failed`.
    pub fn finish_stopped(&self) -> SessionState {
        let mut state = self.inner.lock();
        if *state != SessionState::Failed {
            *state = SessionState::Stopped;
        }
        *state
    }
}

/// Point-in-time view of a session, as returned by `SessionRegistry::list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub identity: String,
    pub display_name: String,
    pub source_locator: String,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    /// Process liveness probed at snapshot time
    pub running: bool,
    pub live_preview_path: PathBuf,
    /// HTTP path under which the preview manifest is served
    pub preview_url: String,
    pub archive_path: PathBuf,
    pub bytes_written: u64,
}
