//! Auto-record reconciliation loop
//!
//! Each tick compares the identities flagged for auto-recording against the
//! registry's running set and starts whatever is live but not recorded. The
//! loop only ever starts sessions: stopping is left to the user, so a flaky
//! liveness signal cannot make recordings flap.

use crate::liveness::LivenessOracle;
use crate::models::{ModelRecord, ModelStore, StatusUpdate};
use crate::recorder::{RecorderError, SessionRegistry, SessionState};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub desired: usize,
    pub already_running: usize,
    pub offline: usize,
    pub started: Vec<String>,
    /// Lost a benign race against another start
    pub duplicates: usize,
    pub liveness_failures: usize,
    pub start_failures: usize,
    /// The roster itself could not be read
    pub roster_failed: bool,
}

pub struct ReconciliationLoop {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ModelStore>,
    oracle: Arc<dyn LivenessOracle>,
    interval: Duration,
    span: tracing::Span,
}

impl ReconciliationLoop {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ModelStore>,
        oracle: Arc<dyn LivenessOracle>,
        interval: Duration,
        span: tracing::Span,
    ) -> Self {
        Self {
            registry,
            store,
            oracle,
            interval,
            span,
        }
    }

    /// Tick every `interval` until `cancel` fires.
    ///
    /// Each tick runs as its own task, so even a panic inside a tick is
    /// logged and the next tick still happens. A tick in progress sees the
    /// same token: it starts nothing once cancelled and is aborted if it does
    /// not return promptly.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            tracing::info!(interval = ?self.interval, "reconciliation loop started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let this = self.clone();
                        let tick_cancel = cancel.clone();
                        let mut tick = tokio::spawn(
                            async move { this.tick_cancellable(&tick_cancel).await }
                                .instrument(tracing::Span::current()),
                        );
                        tokio::select! {
                            joined = &mut tick => match joined {
                                Ok(report) => log_report(&report),
                                Err(e) => tracing::error!(error = %e, "reconciliation tick panicked"),
                            },
                            _ = cancel.cancelled() => {
                                tick.abort();
                                tracing::info!("reconciliation loop cancelled during a tick");
                                break;
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("reconciliation loop cancelled");
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One reconciliation pass
    pub async fn tick(&self) -> TickReport {
        self.tick_cancellable(&CancellationToken::new()).await
    }

    /// One reconciliation pass that stops querying and starting once
    /// `cancel` fires
    pub async fn tick_cancellable(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        let roster = match self.store.auto_record_roster().await {
            Ok(roster) => roster,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read auto-record roster");
                report.roster_failed = true;
                return report;
            }
        };
        report.desired = roster.len();
        if roster.is_empty() {
            tracing::debug!("no identities to monitor");
            return report;
        }

        let running: HashSet<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| s.running || s.state == SessionState::Starting)
            .map(|s| s.identity)
            .collect();

        for model in roster {
            if cancel.is_cancelled() {
                tracing::debug!("tick cancelled");
                break;
            }
            // The store is external; do not trust its filtering
            if !model.auto_record_enabled {
                continue;
            }
            self.reconcile_identity(&model, &running, cancel, &mut report)
                .instrument(tracing::debug_span!("identity", identity = %model.identity))
                .await;
        }

        report
    }

    async fn reconcile_identity(
        &self,
        model: &ModelRecord,
        running: &HashSet<String>,
        cancel: &CancellationToken,
        report: &mut TickReport,
    ) {
        let identity = model.identity.as_str();

        if running.contains(identity) {
            report.already_running += 1;
            tracing::debug!("already recording");
            self.write_status(
                identity,
                StatusUpdate {
                    is_online: true,
                    viewer_count: model.status.viewer_count,
                    thumbnail_path: None,
                    checked_at: Utc::now(),
                },
            )
            .await;
            return;
        }

        let queried = tokio::select! {
            queried = self.oracle.query(identity) => queried,
            _ = cancel.cancelled() => {
                tracing::debug!("liveness query abandoned, shutting down");
                return;
            }
        };
        let liveness = match queried {
            Ok(liveness) => liveness,
            Err(e) => {
                // Transient: try again next tick
                report.liveness_failures += 1;
                tracing::warn!(error = %e, "liveness query failed");
                return;
            }
        };

        self.write_status(
            identity,
            StatusUpdate {
                is_online: liveness.is_online,
                viewer_count: liveness.viewer_count,
                thumbnail_path: None,
                checked_at: Utc::now(),
            },
        )
        .await;

        let Some(locator) = liveness.recordable_locator().map(str::to_string) else {
            report.offline += 1;
            tracing::debug!(online = liveness.is_online, "not recordable");
            return;
        };

        if cancel.is_cancelled() {
            return;
        }
        tracing::info!(viewers = liveness.viewer_count, "identity is live, starting recording");

        let registry = self.registry.clone();
        let owned_identity = identity.to_string();
        let display_name = model.display_name.clone();
        let started = tokio::task::spawn_blocking(move || {
            registry.start(&owned_identity, &locator, display_name.as_deref())
        })
        .await;

        match started {
            Ok(Ok(session)) => {
                tracing::info!(session_id = %session.id(), "auto-recording started");
                report.started.push(identity.to_string());
            }
            Ok(Err(e)) if e.is_duplicate() => {
                report.duplicates += 1;
                tracing::debug!("session started elsewhere in the meantime");
            }
            Ok(Err(RecorderError::ShuttingDown { .. })) => {
                tracing::debug!("registry closed, not starting");
            }
            Ok(Err(e)) => {
                report.start_failures += 1;
                tracing::error!(error = %e, "auto-recording failed to start");
            }
            Err(e) => {
                report.start_failures += 1;
                tracing::error!(error = %e, "start task panicked");
            }
        }
    }

    async fn write_status(&self, identity: &str, update: StatusUpdate) {
        if let Err(e) = self.store.update_status(identity, update).await {
            tracing::warn!(identity, error = %e, "failed to cache model status");
        }
    }
}

fn log_report(report: &TickReport) {
    if !report.started.is_empty() || report.liveness_failures > 0 || report.start_failures > 0 {
        tracing::info!(
            desired = report.desired,
            running = report.already_running,
            started = ?report.started,
            liveness_failures = report.liveness_failures,
            start_failures = report.start_failures,
            "reconciliation tick"
        );
    } else {
        tracing::debug!(
            desired = report.desired,
            running = report.already_running,
            offline = report.offline,
            "reconciliation tick"
        );
    }
}
