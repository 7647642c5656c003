//! Model record schema
//!
//! A model is a recorded identity plus its recording preferences and the
//! last status seen by the reconciliation loop. Configuration fields are
//! only changed by the user; status fields only by the loop.

use crate::utils::slug::is_slug;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Preferred stream variant when the source offers several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    #[default]
    Best,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    Worst,
}

impl std::str::FromStr for QualityPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best" => Ok(Self::Best),
            "1080p" | "1080" => Ok(Self::P1080),
            "720p" | "720" => Ok(Self::P720),
            "480p" | "480" => Ok(Self::P480),
            "worst" => Ok(Self::Worst),
            other => Err(format!("unknown quality '{}'", other)),
        }
    }
}

/// Cached status, written by the reconciliation loop only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub viewer_count: u32,
    #[serde(default)]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(default)]
    pub last_check_at: Option<DateTime<Utc>>,
}

/// A persisted model record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    /// Recording bucket key; also accepted as `username`
    #[serde(alias = "username")]
    pub identity: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Also accepted as `autoRecord`
    #[serde(default = "default_auto_record", alias = "autoRecord")]
    pub auto_record_enabled: bool,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub quality_preference: QualityPreference,

    #[serde(default)]
    pub status: ModelStatus,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_auto_record() -> bool {
    true
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

impl ModelRecord {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            display_name: None,
            auto_record_enabled: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            quality_preference: QualityPreference::default(),
            status: ModelStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_auto_record(mut self, enabled: bool) -> Self {
        self.auto_record_enabled = enabled;
        self
    }

    /// Boundary validation, applied on every load and write
    pub fn validate(&self) -> Result<(), String> {
        if !is_slug(&self.identity) {
            return Err(format!(
                "identity '{}' must use lowercase letters, digits, '-' or '_'",
                self.identity
            ));
        }
        if self.retention_days == 0 {
            return Err(format!(
                "retentionDays for '{}' must be at least 1",
                self.identity
            ));
        }
        Ok(())
    }
}

/// Narrow write channel for the cached status fields
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub is_online: bool,
    pub viewer_count: u32,
    /// `None` leaves the cached thumbnail untouched
    pub thumbnail_path: Option<PathBuf>,
    pub checked_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn apply(&self, status: &mut ModelStatus) {
        status.is_online = self.is_online;
        status.viewer_count = self.viewer_count;
        if let Some(path) = &self.thumbnail_path {
            status.thumbnail_path = Some(path.clone());
        }
        status.last_check_at = Some(self.checked_at);
    }
}
