//! Recording session
//!
//! Binds one encoder process to its stream writer and session metadata.
//! Sessions are created and torn down by the registry only.

use super::error::{RecorderError, RecorderResult};
use super::ffmpeg::{EncodeCommand, EncodeTarget};
use super::layout::Layout;
use super::state::{SessionId, SessionSnapshot, SessionState, StateCell};
use super::writer::{StreamWriter, WriterHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extra wait for the process to be reaped after a forced kill
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeouts applied by [`RecordingSession::stop`]
#[derive(Debug, Clone, Copy)]
pub struct StopTimeouts {
    /// Grace period after the termination signal before a forced kill
    pub terminate: Duration,
    /// Bounded wait for the writer thread
    pub writer_join: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            terminate: Duration::from_secs(10),
            writer_join: Duration::from_secs(2),
        }
    }
}

/// One live recording: encoder process + writer thread + metadata
pub struct RecordingSession {
    id: SessionId,
    identity: String,
    display_name: String,
    source_locator: String,
    started_at: DateTime<Utc>,
    session_dir: PathBuf,
    live_preview_path: PathBuf,
    encoder_log_path: PathBuf,
    archive_path: PathBuf,
    state: Arc<StateCell>,
    stop_flag: Arc<AtomicBool>,
    bytes_written: Arc<AtomicU64>,
    process: Mutex<Option<Child>>,
    writer: Mutex<Option<WriterHandle>>,
    span: tracing::Span,
}

impl RecordingSession {
    /// Create a session in `Starting`. Nothing touches the disk yet.
    pub fn new(
        identity: &str,
        source_locator: &str,
        display_name: Option<&str>,
        layout: &Layout,
        parent: &tracing::Span,
    ) -> Self {
        let id = SessionId::new();
        let started_at = Utc::now();
        let span = tracing::info_span!(
            parent: parent,
            "session",
            session_id = %id,
            identity = %identity
        );

        Self {
            session_dir: layout.session_dir(&id),
            live_preview_path: layout.manifest_path(&id),
            encoder_log_path: layout.encoder_log_path(&id),
            archive_path: layout.archive_path(identity, started_at, &id),
            identity: identity.to_string(),
            display_name: display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(identity)
                .to_string(),
            source_locator: source_locator.to_string(),
            started_at,
            state: Arc::new(StateCell::new(SessionState::Starting)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            bytes_written: Arc::new(AtomicU64::new(0)),
            process: Mutex::new(None),
            writer: Mutex::new(None),
            span,
            id,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn source_locator(&self) -> &str {
        &self.source_locator
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn live_preview_path(&self) -> &Path {
        &self.live_preview_path
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Create directories, spawn the encoder and start the writer thread.
    ///
    /// On success the session is `Running` and bytes are being copied, unless
    /// the encoder already finished. On failure no process is left behind and
    /// the session is `Failed`, or `Stopped` if a stop aborted the launch.
    pub fn launch(&self, encoder: &dyn EncodeCommand) -> RecorderResult<()> {
        let _entered = self.span.enter();

        match self.try_launch(encoder) {
            Ok(()) => {
                if self.state.transition(SessionState::Running).is_some() {
                    tracing::info!(
                        source = %self.source_locator,
                        archive = %self.archive_path.display(),
                        preview = %self.live_preview_path.display(),
                        "recording started"
                    );
                } else {
                    tracing::info!(state = %self.state(), "encoder finished before recording was marked running");
                }
                Ok(())
            }
            Err(e @ RecorderError::StartAborted { .. }) => {
                tracing::info!("start aborted, session was stopped during launch");
                if let Err(cleanup) = fs::remove_dir_all(&self.session_dir) {
                    tracing::debug!(error = %cleanup, "no session directory to clean up");
                }
                Err(e)
            }
            Err(e) => {
                self.state.transition(SessionState::Failed);
                tracing::error!(error = %e, "recording failed to start");
                if let Err(cleanup) = fs::remove_dir_all(&self.session_dir) {
                    tracing::debug!(error = %cleanup, "no session directory to clean up");
                }
                Err(e)
            }
        }
    }

    fn try_launch(&self, encoder: &dyn EncodeCommand) -> RecorderResult<()> {
        fs::create_dir_all(&self.session_dir)?;
        if let Some(records_dir) = self.archive_path.parent() {
            fs::create_dir_all(records_dir)?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.encoder_log_path)?;

        let target = EncodeTarget {
            source_locator: &self.source_locator,
            session_dir: &self.session_dir,
            manifest_path: &self.live_preview_path,
        };
        let mut command = encoder.build(&target);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file));
        #[cfg(unix)]
        {
            // Own process group, so signals reach helper processes too
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let spawn_failure = |source: io::Error| RecorderError::ProcessSpawnFailure {
            identity: self.identity.clone(),
            program: encoder.name().to_string(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_failure)?;
        tracing::debug!(pid = child.id(), program = encoder.name(), "encoder spawned");

        let Some(stdout) = child.stdout.take() else {
            force_kill(&mut child);
            return Err(spawn_failure(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder stdout not captured",
            )));
        };

        let writer = StreamWriter::new(
            stdout,
            self.archive_path.clone(),
            self.stop_flag.clone(),
            self.bytes_written.clone(),
            self.state.clone(),
        );
        let handle = match writer.spawn(format!("ts-writer-{}", self.id), self.span.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                force_kill(&mut child);
                return Err(spawn_failure(e));
            }
        };

        *self.process.lock() = Some(child);
        *self.writer.lock() = Some(handle);

        // stop() may have run while the encoder was being spawned and found
        // nothing to terminate
        if self.stop_flag.load(Ordering::SeqCst) {
            self.abort_launch();
            return Err(RecorderError::StartAborted {
                identity: self.identity.clone(),
            });
        }
        Ok(())
    }

    /// Kill a just-spawned encoder and reap its writer
    fn abort_launch(&self) {
        if let Some(child) = self.process.lock().as_mut() {
            force_kill(child);
        }
        if !self.wait_for_exit(KILL_REAP_TIMEOUT) {
            tracing::error!("aborted encoder still not reaped after kill");
        }

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if !writer.join_timeout(KILL_REAP_TIMEOUT) {
                tracing::warn!("writer of aborted session did not finish, detaching");
            }
        }

        if self.bytes_written() == 0 {
            if let Err(e) = fs::remove_file(&self.archive_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(error = %e, "failed to remove empty archive");
                }
            }
        }
    }

    /// Probe the encoder process right now
    pub fn is_process_alive(&self) -> bool {
        match self.process.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether this session holds the identity's single running slot
    pub fn occupies_identity(&self) -> bool {
        match self.state() {
            SessionState::Starting => true,
            SessionState::Running => self.is_process_alive(),
            _ => false,
        }
    }

    /// Two-phase stop: cooperative flag plus SIGTERM, forced kill after
    /// `timeouts.terminate`, then a bounded join of the writer.
    ///
    /// Always returns with the session in a terminal state.
    pub fn stop(&self, timeouts: StopTimeouts) -> SessionState {
        let _entered = self.span.enter();

        self.state.transition(SessionState::Stopping);
        self.stop_flag.store(true, Ordering::SeqCst);

        self.terminate_process(timeouts.terminate);

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if !writer.join_timeout(timeouts.writer_join) {
                tracing::warn!(
                    timeout = ?timeouts.writer_join,
                    "writer did not finish in time, detaching"
                );
            }
        }

        let final_state = self.state.finish_stopped();

        if let Err(e) = fs::remove_dir_all(&self.session_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(error = %e, dir = %self.session_dir.display(), "failed to remove preview directory");
            }
        }

        tracing::info!(
            state = %final_state,
            bytes = self.bytes_written(),
            "recording stopped"
        );
        final_state
    }

    fn terminate_process(&self, grace: Duration) {
        let pid = match self.process.lock().as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => {
                    if let Err(e) = signal_terminate(child) {
                        tracing::warn!(error = %e, "termination signal failed");
                    }
                    child.id()
                }
                _ => return,
            },
            None => return,
        };

        if self.wait_for_exit(grace) {
            tracing::debug!(pid, "encoder exited after termination signal");
            return;
        }

        tracing::warn!(pid, grace = ?grace, "encoder ignored termination, killing");
        if let Some(child) = self.process.lock().as_mut() {
            force_kill(child);
        }
        if !self.wait_for_exit(KILL_REAP_TIMEOUT) {
            tracing::error!(pid, "encoder still not reaped after kill");
        }
    }

    /// Poll until the process has exited or `timeout` expires.
    ///
    /// The process lock is only held for each non-blocking poll.
    fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let exited = match self.process.lock().as_mut() {
                Some(child) => !matches!(child.try_wait(), Ok(None)),
                None => true,
            };
            if exited {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            identity: self.identity.clone(),
            display_name: self.display_name.clone(),
            source_locator: self.source_locator.clone(),
            started_at: self.started_at,
            state: self.state(),
            running: self.is_process_alive(),
            live_preview_path: self.live_preview_path.clone(),
            preview_url: Layout::preview_url(&self.id),
            archive_path: self.archive_path.clone(),
            bytes_written: self.bytes_written(),
        }
    }
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("archive_path", &self.archive_path)
            .finish()
    }
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) -> io::Result<()> {
    signal_group(child, libc::SIGTERM)
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<()> {
    // The encoder leads its own process group (pgid == pid)
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill() has no memory-safety preconditions; a stale pgid only yields ESRCH.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if signal_group(child, libc::SIGKILL).is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "kill failed, process already gone");
    }
}
