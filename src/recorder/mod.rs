//! Recording system module
//!
//! This module implements the recording core:
//! - SessionRegistry owning the identity -> session map
//! - RecordingSession binding an encoder process to its writer
//! - StreamWriter copying the encoder's raw output into the archive

pub mod error;
pub mod ffmpeg;
pub mod layout;
pub mod registry;
pub mod session;
pub mod state;
pub mod writer;

pub use error::{RecorderError, RecorderResult};
pub use ffmpeg::{EncodeCommand, FfmpegCommand, ShellCommand};
pub use layout::Layout;
pub use registry::SessionRegistry;
pub use session::{RecordingSession, StopTimeouts};
pub use state::{SessionId, SessionSnapshot, SessionState};
