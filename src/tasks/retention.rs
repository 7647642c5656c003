//! Retention sweeper
//!
//! Periodically deletes archives older than their identity's retention
//! window, along with the companion thumbnail and metadata-cache entry.
//! Archives still being written by an active session are never touched.

use crate::models::{ModelRecord, ModelStore};
use crate::recorder::layout::{archive_start_time, is_archive};
use crate::recorder::{Layout, SessionRegistry, SessionState};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("failed to delete {}: {source}", path.display())]
    Delete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list {}: {source}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to update metadata cache {}: {reason}", path.display())]
    MetadataCache { path: PathBuf, reason: String },
}

/// Outcome of one sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub freed_bytes: u64,
    /// Expired archives left alone because a session still writes them
    pub skipped_active: usize,
    pub failures: Vec<RetentionError>,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.deleted.extend(other.deleted);
        self.freed_bytes += other.freed_bytes;
        self.skipped_active += other.skipped_active;
        self.failures.extend(other.failures);
    }
}

pub struct RetentionSweeper {
    layout: Layout,
    store: Arc<dyn ModelStore>,
    /// Source of active sessions; a standalone sweep has none
    registry: Option<Arc<SessionRegistry>>,
    interval: Duration,
    span: tracing::Span,
}

impl RetentionSweeper {
    pub fn new(
        layout: Layout,
        store: Arc<dyn ModelStore>,
        interval: Duration,
        span: tracing::Span,
    ) -> Self {
        Self {
            layout,
            store,
            registry: None,
            interval,
            span,
        }
    }

    /// Never delete archives of sessions live in `registry`
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sweep every `interval` until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            tracing::info!(interval = ?self.interval, "retention sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let this = self.clone();
                        let sweep = tokio::spawn(
                            async move { this.sweep().await }.instrument(tracing::Span::current()),
                        );
                        match sweep.await {
                            Ok(report) => log_report(&report),
                            Err(e) => tracing::error!(error = %e, "retention sweep panicked"),
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("retention sweeper cancelled");
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    ///
    /// Only identities known to the store are swept; archive folders of
    /// removed models are left for the user.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let models = match self.store.list().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read models, skipping retention sweep");
                return report;
            }
        };

        for model in models {
            let ModelRecord {
                identity,
                retention_days,
                ..
            } = model;
            let protected = self.active_archives(&identity);
            let layout = self.layout.clone();
            let span = tracing::debug_span!("retention", identity = %identity);

            let swept = tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                sweep_identity(&layout, &identity, retention_days, now, &protected)
            })
            .await;

            match swept {
                Ok(swept) => report.merge(swept),
                Err(e) => tracing::error!(error = %e, "retention task panicked"),
            }
        }

        report
    }

    /// File names of archives a session may still be writing
    fn active_archives(&self, identity: &str) -> HashSet<OsString> {
        let Some(registry) = &self.registry else {
            return HashSet::new();
        };
        registry
            .list()
            .into_iter()
            .filter(|s| s.identity == identity)
            .filter(|s| {
                s.running
                    || matches!(
                        s.state,
                        SessionState::Starting | SessionState::Running | SessionState::Stopping
                    )
            })
            .filter_map(|s| s.archive_path.file_name().map(|n| n.to_os_string()))
            .collect()
    }
}

/// Delete every expired archive of one identity
pub fn sweep_identity(
    layout: &Layout,
    identity: &str,
    retention_days: u32,
    now: DateTime<Utc>,
    protected: &HashSet<OsString>,
) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = chrono::Duration::try_days(i64::from(retention_days))
        .and_then(|window| now.checked_sub_signed(window))
    else {
        // Window reaches past the representable range: nothing can be old enough
        tracing::debug!(identity, retention_days, "retention window unbounded, keeping all");
        return report;
    };
    let dir = layout.records_dir(identity);

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
        Err(source) => {
            report.failures.push(RetentionError::List { path: dir, source });
            return report;
        }
    };

    let mut removed_names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_archive(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let Some(started) = archive_start_time(&path)
            .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))
        else {
            continue;
        };
        if started >= cutoff {
            continue;
        }

        if protected.contains(entry.file_name().as_os_str()) {
            report.skipped_active += 1;
            tracing::debug!(path = %path.display(), "archive belongs to an active session");
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), size = metadata.len(), "deleted expired archive");
                report.freed_bytes += metadata.len();
                report.deleted.push(path.clone());
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    removed_names.push(name.to_string());
                }
            }
            Err(source) => {
                tracing::error!(path = %path.display(), error = %source, "failed to delete archive");
                report.failures.push(RetentionError::Delete { path: path.clone(), source });
            }
        }

        if let Some(thumbnail) = layout.thumbnail_for(identity, &path) {
            match fs::remove_file(&thumbnail) {
                Ok(()) => tracing::debug!(path = %thumbnail.display(), "deleted thumbnail"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    tracing::warn!(path = %thumbnail.display(), error = %source, "failed to delete thumbnail");
                    report.failures.push(RetentionError::Delete {
                        path: thumbnail,
                        source,
                    });
                }
            }
        }
    }

    if !removed_names.is_empty() {
        let cache = layout.metadata_cache_path(identity);
        if let Err(e) = prune_metadata_cache(&cache, &removed_names) {
            tracing::warn!(error = %e, "failed to prune metadata cache");
            report.failures.push(e);
        }
    }

    report
}

/// Drop cache entries keyed by the removed archive names
fn prune_metadata_cache(path: &Path, names: &[String]) -> Result<(), RetentionError> {
    let cache_err = |reason: String| RetentionError::MetadataCache {
        path: path.to_path_buf(),
        reason,
    };

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(cache_err(e.to_string())),
    };

    let mut cache: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&content).map_err(|e| cache_err(e.to_string()))?;

    let before = cache.len();
    for name in names {
        cache.remove(name);
    }
    if cache.len() == before {
        return Ok(());
    }

    let content = serde_json::to_vec_pretty(&cache).map_err(|e| cache_err(e.to_string()))?;
    fs::write(path, content).map_err(|e| cache_err(e.to_string()))
}

fn log_report(report: &SweepReport) {
    if report.deleted.is_empty() && report.failures.is_empty() {
        tracing::debug!(skipped_active = report.skipped_active, "retention sweep: nothing expired");
        return;
    }
    tracing::info!(
        deleted = report.deleted.len(),
        freed_mb = report.freed_bytes / (1024 * 1024),
        skipped_active = report.skipped_active,
        failures = report.failures.len(),
        "retention sweep finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::SessionId;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn write_archive(layout: &Layout, identity: &str, started: DateTime<Utc>, bytes: usize) -> PathBuf {
        let path = layout.archive_path(identity, started, &SessionId::new());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_deletes_only_expired_archives() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let old = write_archive(&layout, "alice", now() - chrono::Duration::days(10), 100);
        let fresh = write_archive(&layout, "alice", now() - chrono::Duration::days(3), 50);

        let report = sweep_identity(&layout, "alice", 7, now(), &HashSet::new());

        assert_eq!(report.deleted, vec![old.clone()]);
        assert_eq!(report.freed_bytes, 100);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_huge_retention_keeps_everything() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let ancient = write_archive(&layout, "zoe", now() - chrono::Duration::days(3650), 10);

        let report = sweep_identity(&layout, "zoe", u32::MAX, now(), &HashSet::new());

        assert!(report.deleted.is_empty());
        assert!(report.failures.is_empty());
        assert!(ancient.exists());
    }

    #[test]
    fn test_protected_archive_survives() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let old = write_archive(&layout, "bob", now() - chrono::Duration::days(40), 10);
        let protected: HashSet<OsString> = [old.file_name().unwrap().to_os_string()].into();

        let report = sweep_identity(&layout, "bob", 30, now(), &protected);

        assert!(report.deleted.is_empty());
        assert_eq!(report.skipped_active, 1);
        assert!(old.exists());
    }

    #[test]
    fn test_companions_removed_and_cache_pruned() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let old = write_archive(&layout, "carol", now() - chrono::Duration::days(31), 10);
        let keep = write_archive(&layout, "carol", now() - chrono::Duration::days(1), 10);

        let thumb = layout.thumbnail_for("carol", &old).unwrap();
        fs::create_dir_all(thumb.parent().unwrap()).unwrap();
        fs::write(&thumb, b"jpg").unwrap();

        let old_name = old.file_name().unwrap().to_str().unwrap().to_string();
        let keep_name = keep.file_name().unwrap().to_str().unwrap().to_string();
        let cache = layout.metadata_cache_path("carol");
        let mut entries = serde_json::Map::new();
        entries.insert(old_name.clone(), serde_json::json!({"duration": 1}));
        entries.insert(keep_name.clone(), serde_json::json!({"duration": 2}));
        fs::write(&cache, serde_json::Value::Object(entries).to_string()).unwrap();

        let report = sweep_identity(&layout, "carol", 30, now(), &HashSet::new());

        assert_eq!(report.deleted.len(), 1);
        assert!(report.failures.is_empty());
        assert!(!thumb.exists());
        let cache: serde_json::Value = serde_json::from_str(&fs::read_to_string(&cache).unwrap()).unwrap();
        assert!(cache.get(&old_name).is_none());
        assert!(cache.get(&keep_name).is_some());
    }

    #[test]
    fn test_legacy_daily_archive_names() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let records = layout.records_dir("dave");
        fs::create_dir_all(&records).unwrap();
        let legacy = records.join("2026-01-02.ts");
        fs::write(&legacy, b"x").unwrap();

        let report = sweep_identity(&layout, "dave", 30, now(), &HashSet::new());
        assert_eq!(report.deleted, vec![legacy]);
    }

    #[test]
    fn test_non_archives_and_missing_dir_are_ignored() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        assert!(sweep_identity(&layout, "nobody", 1, now(), &HashSet::new())
            .deleted
            .is_empty());

        let records = layout.records_dir("erin");
        fs::create_dir_all(&records).unwrap();
        fs::write(records.join("notes.txt"), b"keep").unwrap();
        let report = sweep_identity(&layout, "erin", 1, now(), &HashSet::new());
        assert!(report.deleted.is_empty());
        assert!(records.join("notes.txt").exists());
    }

    #[test]
    fn test_corrupt_cache_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let old = write_archive(&layout, "frank", now() - chrono::Duration::days(9), 10);
        fs::write(layout.metadata_cache_path("frank"), b"{not json").unwrap();

        let report = sweep_identity(&layout, "frank", 2, now(), &HashSet::new());
        assert!(!old.exists());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0], RetentionError::MetadataCache { .. }));
    }
}
