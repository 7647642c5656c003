//! `streamrec run`: the long-running recorder

use crate::config::Config;
use crate::models::{JsonModelStore, ModelStore};
use crate::recorder::SessionRegistry;
use crate::tasks::{ReconciliationLoop, RetentionSweeper};
use crate::utils::error::AppResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

/// How long a loop may take to notice cancellation
const LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(config: Config) -> AppResult<()> {
    let layout = config.layout();
    info!(output_dir = %layout.root().display(), "starting recorder daemon");

    let registry = Arc::new(SessionRegistry::new(
        layout.clone(),
        config.encoder(),
        config.stop_timeouts(),
        info_span!("registry"),
    )?);
    registry.purge_stale_previews();

    let store: Arc<dyn ModelStore> = Arc::new(JsonModelStore::new(
        layout.models_file(),
        info_span!("store"),
    ));
    let oracle = Arc::new(config.liveness_oracle()?);

    let reconcile = Arc::new(ReconciliationLoop::new(
        registry.clone(),
        store.clone(),
        oracle,
        config.auto_record_interval(),
        info_span!("reconcile"),
    ));
    let sweeper = Arc::new(
        RetentionSweeper::new(
            layout,
            store,
            config.cleanup_interval(),
            info_span!("retention"),
        )
        .with_registry(registry.clone()),
    );

    let cancel = CancellationToken::new();
    let loops = vec![
        ("reconcile", tokio::spawn(reconcile.run(cancel.clone()))),
        ("retention", tokio::spawn(sweeper.run(cancel.clone()))),
    ];

    super::shutdown_signal().await;
    info!("shutting down");
    cancel.cancel();
    // A tick that outlives its loop must not start anything stop_all misses
    registry.close();

    for (name, handle) in loops {
        join_loop(name, handle).await;
    }

    let stopped = tokio::task::spawn_blocking(move || registry.stop_all())
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "stopping sessions panicked");
            0
        });
    info!(stopped, "recorder daemon stopped");
    Ok(())
}

async fn join_loop(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => info!(task = name, "loop stopped"),
        Ok(Err(e)) => warn!(task = name, error = %e, "loop ended abnormally"),
        Err(_) => {
            warn!(task = name, "loop did not stop in time, aborting");
            handle.abort();
        }
    }
}
