//! In-memory fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamrec_lib::liveness::{LivenessError, LivenessOracle, LivenessReport};
use streamrec_lib::models::{ModelRecord, ModelStore, StatusUpdate, StoreError, StoreResult};
use streamrec_lib::recorder::{Layout, SessionRegistry, ShellCommand, StopTimeouts};
use tempfile::TempDir;

pub const STREAM_SCRIPT: &str = "while :; do printf 0123456789; sleep 0.02; done";

#[derive(Default)]
pub struct MemoryStore {
    models: Mutex<Vec<ModelRecord>>,
}

impl MemoryStore {
    pub fn with(models: Vec<ModelRecord>) -> Arc<Self> {
        Arc::new(Self {
            models: Mutex::new(models),
        })
    }

    pub fn status_of(&self, identity: &str) -> Option<streamrec_lib::models::ModelStatus> {
        self.models
            .lock()
            .iter()
            .find(|m| m.identity == identity)
            .map(|m| m.status.clone())
    }
}

#[async_trait]
impl ModelStore for MemoryStore {
    async fn list(&self) -> StoreResult<Vec<ModelRecord>> {
        Ok(self.models.lock().clone())
    }

    async fn upsert(&self, record: ModelRecord) -> StoreResult<()> {
        let mut models = self.models.lock();
        models.retain(|m| m.identity != record.identity);
        models.push(record);
        Ok(())
    }

    async fn remove(&self, identity: &str) -> StoreResult<bool> {
        let mut models = self.models.lock();
        let before = models.len();
        models.retain(|m| m.identity != identity);
        Ok(models.len() != before)
    }

    async fn update_status(&self, identity: &str, update: StatusUpdate) -> StoreResult<()> {
        let mut models = self.models.lock();
        let record = models
            .iter_mut()
            .find(|m| m.identity == identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        update.apply(&mut record.status);
        Ok(())
    }
}

#[derive(Clone)]
pub enum Answer {
    Live { locator: String, viewers: u32 },
    Offline,
    Fail,
    /// Never answers
    Hang,
}

/// Scripted oracle; unknown identities are offline
#[derive(Default)]
pub struct ScriptedOracle {
    answers: Mutex<HashMap<String, Answer>>,
    queries: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, identity: &str, answer: Answer) {
        self.answers.lock().insert(identity.to_string(), answer);
    }

    pub fn live(&self, identity: &str) {
        self.set(
            identity,
            Answer::Live {
                locator: format!("http://edge.test/{}/playlist.m3u8", identity),
                viewers: 10,
            },
        );
    }

    pub fn queried(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessOracle for ScriptedOracle {
    async fn query(&self, identity: &str) -> Result<LivenessReport, LivenessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(identity.to_string());
        let answer = self
            .answers
            .lock()
            .get(identity)
            .cloned()
            .unwrap_or(Answer::Offline);
        match answer {
            Answer::Live { locator, viewers } => Ok(LivenessReport::online(locator, viewers)),
            Answer::Offline => Ok(LivenessReport::offline()),
            Answer::Fail => Err(LivenessError::Status {
                identity: identity.to_string(),
                status: 503,
            }),
            Answer::Hang => std::future::pending().await,
        }
    }
}

pub fn registry(dir: &TempDir, script: &str) -> Arc<SessionRegistry> {
    Arc::new(
        SessionRegistry::new(
            Layout::new(dir.path()),
            Arc::new(ShellCommand::new(script)),
            StopTimeouts {
                terminate: Duration::from_secs(5),
                writer_join: Duration::from_secs(2),
            },
            tracing::Span::none(),
        )
        .unwrap(),
    )
}
