//! streamrec - continuous live-stream recorder.
//!
//! Each recorded identity gets at most one running session: an encoder
//! process feeding a rolling HLS preview and, through a writer thread, a
//! durable MPEG-TS archive. Two background loops drive the recorder:
//! auto-record reconciliation and archive retention.

pub mod commands;
pub mod config;
pub mod liveness;
pub mod models;
pub mod recorder;
pub mod tasks;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging.
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks debug or info for
/// this crate.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "streamrec_lib=debug,streamrec=debug"
    } else {
        "streamrec_lib=info,streamrec=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
