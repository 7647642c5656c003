//! Session registry
//!
//! Owns every live [`RecordingSession`] and enforces that an identity has
//! at most one running session. The map lock only covers bookkeeping:
//! spawning, directory creation, signalling and joins all happen after it is
//! released, so a slow start or stop never holds up other identities.

use super::error::{RecorderError, RecorderResult};
use super::ffmpeg::EncodeCommand;
use super::layout::Layout;
use super::session::{RecordingSession, StopTimeouts};
use super::state::{SessionId, SessionSnapshot};
use crate::utils::slug::is_slug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SessionRegistry {
    layout: Layout,
    encoder: Arc<dyn EncodeCommand>,
    timeouts: StopTimeouts,
    sessions: Mutex<HashMap<SessionId, Arc<RecordingSession>>>,
    closed: AtomicBool,
    span: tracing::Span,
}

impl SessionRegistry {
    /// Create the registry and its directory roots
    pub fn new(
        layout: Layout,
        encoder: Arc<dyn EncodeCommand>,
        timeouts: StopTimeouts,
        span: tracing::Span,
    ) -> RecorderResult<Self> {
        fs::create_dir_all(layout.sessions_root())?;
        fs::create_dir_all(layout.records_root())?;
        fs::create_dir_all(layout.thumbnails_root())?;

        Ok(Self {
            layout,
            encoder,
            timeouts,
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            span,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Refuse every later [`start`](Self::start). Sessions already registered
    /// are left alone; `stop_all` still reaches them.
    pub fn close(&self) {
        // Taken under the map lock so no start can slip between check and insert
        let _sessions = self.sessions.lock();
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove preview directories not owned by a session of this registry.
    ///
    /// Meant for daemon startup, when anything under `sessions/` was left
    /// behind by a previous process.
    pub fn purge_stale_previews(&self) -> usize {
        let _entered = self.span.enter();
        let entries = match fs::read_dir(self.layout.sessions_root()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list session directories");
                return 0;
            }
        };
        let owned: Vec<std::path::PathBuf> = self
            .sessions
            .lock()
            .values()
            .map(|s| s.live_preview_path().to_path_buf())
            .collect();

        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || owned.iter().any(|p| p.starts_with(&path)) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(error = %e, path = %path.display(), "failed to remove stale preview"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed stale preview directories");
        }
        removed
    }

    /// Start recording `identity` from `source_locator`.
    ///
    /// Fails with [`RecorderError::DuplicateActiveSession`] without spawning
    /// anything if the identity already has a running (or starting) session,
    /// and with [`RecorderError::ShuttingDown`] once the registry is closed.
    /// The returned session is already copying bytes.
    pub fn start(
        &self,
        identity: &str,
        source_locator: &str,
        display_name: Option<&str>,
    ) -> RecorderResult<Arc<RecordingSession>> {
        if !is_slug(identity) {
            return Err(RecorderError::InvalidIdentity(identity.to_string()));
        }

        let session = Arc::new(RecordingSession::new(
            identity,
            source_locator,
            display_name,
            &self.layout,
            &self.span,
        ));

        {
            let mut sessions = self.sessions.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(RecorderError::ShuttingDown {
                    identity: identity.to_string(),
                });
            }
            if let Some(existing) = sessions
                .values()
                .find(|s| s.identity() == identity && s.occupies_identity())
            {
                let _entered = self.span.enter();
                tracing::debug!(identity, existing = %existing.id(), "start refused, session already active");
                return Err(RecorderError::DuplicateActiveSession {
                    identity: identity.to_string(),
                    existing: existing.id().clone(),
                });
            }
            // Reserve the identity while the encoder is launched
            sessions.insert(session.id().clone(), session.clone());
        }

        if let Err(e) = session.launch(self.encoder.as_ref()) {
            self.sessions.lock().remove(session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// Stop a session and remove it from the registry.
    ///
    /// Returns `false` if the id is unknown. Bounded by the configured
    /// termination and writer-join timeouts.
    pub fn stop(&self, id: &SessionId) -> bool {
        let session = self.sessions.lock().get(id).cloned();
        let Some(session) = session else {
            return false;
        };

        session.stop(self.timeouts);

        let mut sessions = self.sessions.lock();
        if sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.remove(id);
        }
        true
    }

    /// Stop every session, in parallel. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.lock().keys().cloned().collect();
        if ids.is_empty() {
            return 0;
        }
        {
            let _entered = self.span.enter();
            tracing::info!(count = ids.len(), "stopping all sessions");
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|id| scope.spawn(move || self.stop(id)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(false))
                .filter(|stopped| *stopped)
                .count()
        })
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<RecordingSession>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Snapshot of all sessions, oldest first.
    ///
    /// The `running` flag is probed per call, never cached.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<RecordingSession>> =
            self.sessions.lock().values().cloned().collect();

        let mut snapshots: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::recorder::ffmpeg::{EncodeTarget, FfmpegCommand, ShellCommand};
    use crate::recorder::state::SessionState;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    const STREAM_SCRIPT: &str = "while :; do printf 0123456789; sleep 0.02; done";
    const STUBBORN_SCRIPT: &str = "trap '' TERM; while :; do printf x; sleep 0.05; done";

    fn registry_with(script: &str, terminate: Duration) -> (TempDir, SessionRegistry) {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(
            Layout::new(dir.path()),
            Arc::new(ShellCommand::new(script)),
            StopTimeouts {
                terminate,
                writer_join: Duration::from_secs(2),
            },
            tracing::Span::none(),
        )
        .unwrap();
        (dir, registry)
    }

    /// Shell encoder whose command takes a while to build
    struct SlowCommand {
        inner: ShellCommand,
        delay: Duration,
    }

    impl EncodeCommand for SlowCommand {
        fn name(&self) -> &str {
            "slow-sh"
        }

        fn build(&self, target: &EncodeTarget<'_>) -> std::process::Command {
            std::thread::sleep(self.delay);
            self.inner.build(target)
        }
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        check()
    }

    #[test]
    fn test_start_runs_session_and_writes_archive() {
        let (_dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        let session = registry.start("alice", "http://a/live.m3u8", Some("Alice")).unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert!(wait_until(Duration::from_secs(3), || session.bytes_written() > 0));

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert!(list[0].running);
        assert_eq!(list[0].identity, "alice");
        assert_eq!(list[0].display_name, "Alice");
        assert!(list[0].preview_url.ends_with("/stream.m3u8"));

        assert!(registry.stop(session.id()));
    }

    #[test]
    fn test_duplicate_start_is_refused() {
        let (dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        let first = registry.start("alice", "http://one", None).unwrap();

        let err = registry.start("alice", "http://two", None).unwrap_err();
        assert!(err.is_duplicate());

        let alice: Vec<_> = registry
            .list()
            .into_iter()
            .filter(|s| s.identity == "alice")
            .collect();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].source_locator, "http://one");

        // Only the first session ever got a preview directory
        let session_dirs = fs::read_dir(dir.path().join("sessions")).unwrap().count();
        assert_eq!(session_dirs, 1);

        registry.stop(first.id());
    }

    #[test]
    fn test_other_identities_are_independent() {
        let (_dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        let a = registry.start("alice", "http://a", None).unwrap();
        let b = registry.start("bob", "http://b", None).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.stop_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Stopped);
        assert_eq!(b.state(), SessionState::Stopped);
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        let (_dir, registry) = registry_with(STUBBORN_SCRIPT, Duration::from_millis(300));
        let session = registry.start("carol", "http://c", None).unwrap();
        assert!(wait_until(Duration::from_secs(3), || session.bytes_written() > 0));

        let started = Instant::now();
        assert!(registry.stop(session.id()));
        let elapsed = started.elapsed();

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.is_process_alive());
        assert!(elapsed < Duration::from_secs(5), "stop took {:?}", elapsed);
        assert!(registry.get(session.id()).is_none());
    }

    #[test]
    fn test_archive_matches_bytes_copied() {
        let (_dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        let session = registry.start("dave", "http://d", None).unwrap();
        assert!(wait_until(Duration::from_secs(3), || session.bytes_written() >= 50));

        registry.stop(session.id());

        let on_disk = fs::metadata(session.archive_path()).unwrap().len();
        assert_eq!(on_disk, session.bytes_written());
        assert!(!session.live_preview_path().parent().unwrap().exists());
    }

    #[test]
    fn test_encoder_exit_frees_identity() {
        let (_dir, registry) = registry_with("printf done", Duration::from_secs(5));
        let first = registry.start("erin", "http://e", None).unwrap();

        assert!(wait_until(Duration::from_secs(3), || first.state() == SessionState::Stopped));
        assert!(wait_until(Duration::from_secs(3), || !first.is_process_alive()));
        assert_eq!(fs::read(first.archive_path()).unwrap(), b"done");

        let listed = registry.list();
        assert!(!listed[0].running);

        let second = registry.start("erin", "http://e2", None).unwrap();
        assert_ne!(first.id(), second.id());
        assert_ne!(first.archive_path(), second.archive_path());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(
            Layout::new(dir.path()),
            Arc::new(FfmpegCommand {
                ffmpeg_path: "/nonexistent/bin/ffmpeg".to_string(),
                ..Default::default()
            }),
            StopTimeouts::default(),
            tracing::Span::none(),
        )
        .unwrap();

        let err = registry.start("frank", "http://f", None).unwrap_err();
        assert!(matches!(err, RecorderError::ProcessSpawnFailure { .. }));
        assert!(registry.is_empty());
        assert_eq!(fs::read_dir(dir.path().join("sessions")).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_identity_is_rejected() {
        let (_dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        let err = registry.start("../etc", "http://x", None).unwrap_err();
        assert!(matches!(err, RecorderError::InvalidIdentity(_)));
    }

    #[test]
    fn test_stop_unknown_session() {
        let (_dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        assert!(!registry.stop(&SessionId::from("missing")));
    }

    #[test]
    fn test_stale_previews_are_purged() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("sessions").join("old-session");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("seg_000001.ts"), b"x").unwrap();

        let registry = SessionRegistry::new(
            Layout::new(dir.path()),
            Arc::new(ShellCommand::new(STREAM_SCRIPT)),
            StopTimeouts::default(),
            tracing::Span::none(),
        )
        .unwrap();
        assert!(stale.exists());

        let live = registry.start("alice", "http://a", None).unwrap();
        assert_eq!(registry.purge_stale_previews(), 1);
        assert!(!stale.exists());
        assert!(live.live_preview_path().parent().unwrap().exists());
        registry.stop_all();
    }

    #[test]
    fn test_stop_during_launch_leaves_no_encoder() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(
            SessionRegistry::new(
                Layout::new(dir.path()),
                Arc::new(SlowCommand {
                    inner: ShellCommand::new(STREAM_SCRIPT),
                    delay: Duration::from_millis(500),
                }),
                StopTimeouts {
                    terminate: Duration::from_secs(2),
                    writer_join: Duration::from_secs(2),
                },
                tracing::Span::none(),
            )
            .unwrap(),
        );

        let starter = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.start("gina", "http://g", None))
        };

        assert!(wait_until(Duration::from_secs(3), || registry.len() == 1));
        let id = registry.list()[0].id.clone();
        let session = registry.get(&id).unwrap();
        assert_eq!(session.state(), SessionState::Starting);
        assert!(registry.stop(&id));

        let err = starter.join().unwrap().unwrap_err();
        assert!(matches!(err, RecorderError::StartAborted { .. }));
        assert!(registry.is_empty());
        assert!(!session.is_process_alive());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.live_preview_path().parent().unwrap().exists());
    }

    #[test]
    fn test_closed_registry_refuses_start() {
        let (dir, registry) = registry_with(STREAM_SCRIPT, Duration::from_secs(5));
        let running = registry.start("alice", "http://a", None).unwrap();

        registry.close();
        assert!(registry.is_closed());
        let err = registry.start("bob", "http://b", None).unwrap_err();
        assert!(matches!(err, RecorderError::ShuttingDown { .. }));
        assert_eq!(registry.len(), 1);
        assert_eq!(fs::read_dir(dir.path().join("sessions")).unwrap().count(), 1);

        assert_eq!(registry.stop_all(), 1);
        assert_eq!(running.state(), SessionState::Stopped);
    }
}
