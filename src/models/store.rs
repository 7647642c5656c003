//! Model store
//!
//! `ModelStore` is the seam the control loops read desired state from.
//! `JsonModelStore` keeps records in `models.json`, accepting both the
//! `{"models": [...]}` document and a bare array on read.

use super::schema::{ModelRecord, StatusUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid model record: {0}")]
    Validation(String),

    #[error("model not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<ModelRecord>>;

    async fn get(&self, identity: &str) -> StoreResult<Option<ModelRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|m| m.identity == identity))
    }

    /// Insert or replace the user-editable fields of a record.
    /// Cached status is preserved for existing records.
    async fn upsert(&self, record: ModelRecord) -> StoreResult<()>;

    async fn remove(&self, identity: &str) -> StoreResult<bool>;

    /// Status write channel used by the reconciliation loop
    async fn update_status(&self, identity: &str, update: StatusUpdate) -> StoreResult<()>;

    /// Identities flagged for automatic recording
    async fn auto_record_roster(&self) -> StoreResult<Vec<ModelRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.auto_record_enabled)
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredDocument {
    Wrapped { models: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

#[derive(Serialize)]
struct DocumentOut {
    models: Vec<serde_json::Value>,
}

/// Contents of `models.json` as read for a read-modify-write cycle
struct Loaded {
    records: Vec<ModelRecord>,
    /// Entries that were not served (unreadable, invalid or duplicate),
    /// kept verbatim so a rewrite does not lose hand edits
    skipped: Vec<serde_json::Value>,
}

/// `models.json` backed store
pub struct JsonModelStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
    span: tracing::Span,
}

impl JsonModelStore {
    pub fn new(path: impl Into<PathBuf>, span: tracing::Span) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            span,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<Loaded> {
        let mut loaded = Loaded {
            records: Vec::new(),
            skipped: Vec::new(),
        };
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(loaded),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(loaded);
        }

        let values = match serde_json::from_str::<StoredDocument>(&content)? {
            StoredDocument::Wrapped { models } => models,
            StoredDocument::Bare(models) => models,
        };

        for value in values {
            let record = match serde_json::from_value::<ModelRecord>(value.clone()) {
                Ok(record) => record,
                Err(e) => {
                    let _entered = self.span.enter();
                    tracing::warn!(error = %e, path = %self.path.display(), "skipping unreadable model record");
                    loaded.skipped.push(value);
                    continue;
                }
            };
            if let Err(reason) = record.validate() {
                let _entered = self.span.enter();
                tracing::warn!(reason = %reason, "skipping invalid model record");
                loaded.skipped.push(value);
                continue;
            }
            if loaded.records.iter().any(|r| r.identity == record.identity) {
                let _entered = self.span.enter();
                tracing::warn!(identity = %record.identity, "skipping duplicate model record");
                loaded.skipped.push(value);
                continue;
            }
            loaded.records.push(record);
        }
        Ok(loaded)
    }

    async fn save(&self, loaded: Loaded) -> StoreResult<()> {
        let path = self.path.clone();
        let mut models = Vec::with_capacity(loaded.records.len() + loaded.skipped.len());
        for record in &loaded.records {
            models.push(serde_json::to_value(record)?);
        }
        models.extend(loaded.skipped);
        let content = serde_json::to_vec_pretty(&DocumentOut { models })?;

        tokio::task::spawn_blocking(move || write_atomically(&path, &content))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it
fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ModelStore for JsonModelStore {
    async fn list(&self) -> StoreResult<Vec<ModelRecord>> {
        Ok(self.load().await?.records)
    }

    async fn upsert(&self, record: ModelRecord) -> StoreResult<()> {
        record.validate().map_err(StoreError::Validation)?;

        let _guard = self.write_lock.lock().await;
        let mut loaded = self.load().await?;
        match loaded.records.iter_mut().find(|r| r.identity == record.identity) {
            Some(existing) => {
                let status = std::mem::take(&mut existing.status);
                let created_at = existing.created_at;
                *existing = ModelRecord {
                    status,
                    created_at,
                    ..record
                };
            }
            None => loaded.records.push(record),
        }
        self.save(loaded).await
    }

    async fn remove(&self, identity: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut loaded = self.load().await?;
        let before = loaded.records.len();
        loaded.records.retain(|r| r.identity != identity);
        if loaded.records.len() == before {
            return Ok(false);
        }
        self.save(loaded).await?;
        Ok(true)
    }

    async fn update_status(&self, identity: &str, update: StatusUpdate) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut loaded = self.load().await?;
        let record = loaded
            .records
            .iter_mut()
            .find(|r| r.identity == identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        update.apply(&mut record.status);
        self.save(loaded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> JsonModelStore {
        JsonModelStore::new(dir.join("models.json"), tracing::Span::none())
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        store
            .upsert(ModelRecord::new("alice").with_retention_days(7))
            .await
            .unwrap();
        let alice = store.get("alice").await.unwrap().unwrap();
        assert_eq!(alice.retention_days, 7);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"models\""));
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_record() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store.upsert(ModelRecord::new("Not Valid")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_upsert_preserves_status() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.upsert(ModelRecord::new("bob")).await.unwrap();
        store
            .update_status(
                "bob",
                StatusUpdate {
                    is_online: true,
                    viewer_count: 42,
                    thumbnail_path: None,
                    checked_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        store
            .upsert(ModelRecord::new("bob").with_auto_record(false))
            .await
            .unwrap();

        let bob = store.get("bob").await.unwrap().unwrap();
        assert!(!bob.auto_record_enabled);
        assert!(bob.status.is_online);
        assert_eq!(bob.status.viewer_count, 42);
    }

    #[tokio::test]
    async fn test_update_status_unknown_identity() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store
            .update_status(
                "ghost",
                StatusUpdate {
                    is_online: false,
                    viewer_count: 0,
                    thumbnail_path: None,
                    checked_at: Utc::now(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reads_bare_array_and_skips_bad_entries() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(
            store.path(),
            r#"[{"username": "carol", "autoRecord": true},
                {"username": "Bad Entry"},
                {"nothing": 1},
                {"identity": "dave", "autoRecordEnabled": false}]"#,
        )
        .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);

        let roster = store.auto_record_roster().await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].identity, "carol");
    }

    #[tokio::test]
    async fn test_rewrite_keeps_skipped_entries() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(
            store.path(),
            r#"{"models": [{"identity": "alice"},
                           {"identity": "Bob Typo", "retentionDays": 3},
                           {"identity": "alice", "retentionDays": 99}]}"#,
        )
        .unwrap();

        store
            .update_status(
                "alice",
                StatusUpdate {
                    is_online: true,
                    viewer_count: 5,
                    thumbnail_path: None,
                    checked_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("Bob Typo"));
        assert!(raw.contains("\"retentionDays\": 99"));

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].identity, "alice");
        assert_eq!(all[0].status.viewer_count, 5);

        // Still there after an unrelated remove
        store.upsert(ModelRecord::new("carol")).await.unwrap();
        assert!(store.remove("carol").await.unwrap());
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("Bob Typo"));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.upsert(ModelRecord::new("erin")).await.unwrap();
        assert!(store.remove("erin").await.unwrap());
        assert!(!store.remove("erin").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
