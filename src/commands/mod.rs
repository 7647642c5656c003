//! Command-line handlers
//!
//! Each subcommand maps to one handler module. Handlers return
//! [`AppResult`] and leave rendering of the error to the binary.

pub mod daemon;
pub mod maintenance;
pub mod model;
pub mod record;

use crate::config::{Config, ConfigOverrides};
use crate::models::QualityPreference;
use crate::utils::error::AppResult;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// streamrec - record live streams into a rolling preview and a durable archive
#[derive(Parser, Debug)]
#[command(name = "streamrec")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory for sessions, records, thumbnails and models.json
    #[arg(long, value_name = "DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// FFmpeg binary to launch
    #[arg(long, value_name = "PATH", global = true)]
    pub ffmpeg_path: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the auto-record and retention loops until interrupted
    Run {
        /// Seconds between auto-record checks
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,

        /// Seconds between retention sweeps
        #[arg(long, value_name = "SECS")]
        cleanup_interval: Option<u64>,
    },

    /// Record one source until interrupted or the stream ends
    Record {
        identity: String,
        source_locator: String,

        #[arg(long)]
        display_name: Option<String>,
    },

    /// Manage the recorded identities
    #[command(subcommand)]
    Model(ModelCommand),

    /// Run one retention sweep and exit
    Sweep {
        #[arg(long)]
        json: bool,
    },

    /// Show models with their cached status and archive usage
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ModelCommand {
    /// Add a model, or update an existing one
    Add(ModelArgs),

    /// Change settings of an existing model
    Set(ModelArgs),

    /// Remove a model; its archives are kept
    Remove { identity: String },

    /// List models
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct ModelArgs {
    pub identity: String,

    #[arg(long)]
    pub display_name: Option<String>,

    #[arg(long, value_name = "DAYS")]
    pub retention_days: Option<u32>,

    /// Record automatically when the identity goes live
    #[arg(long, value_name = "BOOL")]
    pub auto_record: Option<bool>,

    #[arg(long, value_name = "QUALITY")]
    pub quality: Option<QualityPreference>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        let (auto_record_interval, cleanup_interval) = match &self.command {
            Command::Run {
                interval,
                cleanup_interval,
            } => (*interval, *cleanup_interval),
            _ => (None, None),
        };
        ConfigOverrides {
            config_path: self.config.clone(),
            output_dir: self.output_dir.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            auto_record_interval,
            cleanup_interval,
        }
    }
}

/// Run the selected subcommand against a resolved configuration
pub async fn dispatch(command: Command, config: Config) -> AppResult<()> {
    match command {
        Command::Run { .. } => daemon::run(config).await,
        Command::Record {
            identity,
            source_locator,
            display_name,
        } => record::record(config, &identity, &source_locator, display_name.as_deref()).await,
        Command::Model(cmd) => model::handle(config, cmd).await,
        Command::Sweep { json } => maintenance::sweep(config, json).await,
        Command::Status { json } => maintenance::status(config, json).await,
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received Ctrl-C");
}
