//! On-disk layout
//!
//! ```text
//! <output_dir>/
//!   sessions/<session id>/stream.m3u8, seg_000001.ts, ffmpeg.log   (ephemeral)
//!   records/<identity>/<YYYYMMDDTHHMMSSZ>_<suffix>.ts             (durable)
//!   records/<identity>/.metadata_cache.json
//!   thumbnails/<identity>/<archive stem>.jpg
//!   models.json
//! ```

use super::state::SessionId;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};

pub const MANIFEST_NAME: &str = "stream.m3u8";
pub const SEGMENT_PATTERN: &str = "seg_%06d.ts";
pub const ENCODER_LOG_NAME: &str = "ffmpeg.log";
pub const ARCHIVE_EXTENSION: &str = "ts";
pub const METADATA_CACHE_NAME: &str = ".metadata_cache.json";
pub const THUMBNAIL_EXTENSION: &str = "jpg";

const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const LEGACY_DAY_FORMAT: &str = "%Y-%m-%d";

/// Resolves every path the recorder reads or writes
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn records_root(&self) -> PathBuf {
        self.root.join("records")
    }

    pub fn thumbnails_root(&self) -> PathBuf {
        self.root.join("thumbnails")
    }

    pub fn models_file(&self) -> PathBuf {
        self.root.join("models.json")
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.sessions_root().join(id.as_str())
    }

    pub fn manifest_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(MANIFEST_NAME)
    }

    pub fn encoder_log_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(ENCODER_LOG_NAME)
    }

    pub fn records_dir(&self, identity: &str) -> PathBuf {
        self.records_root().join(identity)
    }

    pub fn thumbnails_dir(&self, identity: &str) -> PathBuf {
        self.thumbnails_root().join(identity)
    }

    pub fn metadata_cache_path(&self, identity: &str) -> PathBuf {
        self.records_dir(identity).join(METADATA_CACHE_NAME)
    }

    /// Archive path for a session started at `started_at`.
    ///
    /// The timestamp plus the session id suffix keeps names unique across
    /// restarts, even for two sessions started within the same second.
    pub fn archive_path(&self, identity: &str, started_at: DateTime<Utc>, id: &SessionId) -> PathBuf {
        let name = format!(
            "{}_{}.{}",
            started_at.format(ARCHIVE_TIMESTAMP_FORMAT),
            id.short(),
            ARCHIVE_EXTENSION
        );
        self.records_dir(identity).join(name)
    }

    /// Companion thumbnail for an archive
    pub fn thumbnail_for(&self, identity: &str, archive: &Path) -> Option<PathBuf> {
        let stem = archive.file_stem()?.to_str()?;
        Some(
            self.thumbnails_dir(identity)
                .join(format!("{}.{}", stem, THUMBNAIL_EXTENSION)),
        )
    }

    /// Relative URL under which the preview manifest is served
    pub fn preview_url(id: &SessionId) -> String {
        format!("/streams/sessions/{}/{}", id, MANIFEST_NAME)
    }
}

/// Recover the start time encoded in an archive file name.
///
/// Understands `<YYYYMMDDTHHMMSSZ>_<suffix>.ts` and the older daily
/// `<YYYY-MM-DD>.ts` files (taken as local midnight, stored as UTC).
pub fn archive_start_time(path: &Path) -> Option<DateTime<Utc>> {
    let stem = path.file_stem()?.to_str()?;

    let stamp = stem.split('_').next().unwrap_or(stem);
    if let Ok(naive) = NaiveDateTime::parse_from_str(stamp, ARCHIVE_TIMESTAMP_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }

    let day = NaiveDate::parse_from_str(stem, LEGACY_DAY_FORMAT).ok()?;
    let midnight = day.and_hms_opt(0, 0, 0)?;
    chrono::Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Whether `path` looks like an archive file
pub fn is_archive(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}
