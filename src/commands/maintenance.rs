//! `streamrec sweep` and `streamrec status`

use crate::config::Config;
use crate::models::{JsonModelStore, ModelStore};
use crate::recorder::layout::is_archive;
use crate::recorder::Layout;
use crate::tasks::RetentionSweeper;
use crate::utils::error::AppResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info_span;

pub async fn sweep(config: Config, json: bool) -> AppResult<()> {
    let layout = config.layout();
    let store = Arc::new(JsonModelStore::new(layout.models_file(), info_span!("store")));
    let sweeper = RetentionSweeper::new(
        layout,
        store,
        config.cleanup_interval(),
        info_span!("retention"),
    );

    let mut report = sweeper.sweep().await;

    if json {
        let failures: Vec<String> = report.failures.iter().map(|e| e.to_string()).collect();
        let out = serde_json::json!({
            "deleted": report.deleted,
            "freedBytes": report.freed_bytes,
            "skippedActive": report.skipped_active,
            "failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for path in &report.deleted {
            println!("deleted {}", path.display());
        }
        println!(
            "{} archive(s) deleted, {:.1} MiB freed",
            report.deleted.len(),
            report.freed_bytes as f64 / (1024.0 * 1024.0)
        );
        for failure in &report.failures {
            eprintln!("error: {}", failure);
        }
    }

    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(report.failures.remove(0).into())
    }
}

/// One row of `streamrec status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub identity: String,
    pub auto_record_enabled: bool,
    pub retention_days: u32,
    pub is_online: bool,
    pub viewer_count: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub archive_count: usize,
    pub archive_bytes: u64,
}

pub async fn status(config: Config, json: bool) -> AppResult<()> {
    let layout = config.layout();
    let store = JsonModelStore::new(layout.models_file(), info_span!("store"));
    let models = store.list().await?;

    let rows = tokio::task::spawn_blocking(move || {
        models
            .into_iter()
            .map(|m| {
                let (archive_count, archive_bytes) = archive_usage(&layout, &m.identity);
                ModelUsage {
                    identity: m.identity,
                    auto_record_enabled: m.auto_record_enabled,
                    retention_days: m.retention_days,
                    is_online: m.status.is_online,
                    viewer_count: m.status.viewer_count,
                    last_check_at: m.status.last_check_at,
                    archive_count,
                    archive_bytes,
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<7} {:>8} {:>9} {:>10}  {}",
        "IDENTITY", "ONLINE", "VIEWERS", "ARCHIVES", "SIZE (MiB)", "LAST CHECK"
    );
    for row in &rows {
        println!(
            "{:<24} {:<7} {:>8} {:>9} {:>10.1}  {}",
            row.identity,
            if row.is_online { "yes" } else { "no" },
            row.viewer_count,
            row.archive_count,
            row.archive_bytes as f64 / (1024.0 * 1024.0),
            row.last_check_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
    }
    Ok(())
}

/// Number and total size of the archives kept for `identity`
pub fn archive_usage(layout: &Layout, identity: &str) -> (usize, u64) {
    let Ok(entries) = std::fs::read_dir(layout.records_dir(identity)) else {
        return (0, 0);
    };
    entries
        .flatten()
        .filter(|e| is_archive(&e.path()))
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .fold((0, 0), |(count, bytes), m| (count + 1, bytes + m.len()))
}
