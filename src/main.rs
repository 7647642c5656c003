//! streamrec binary

use anyhow::{Context, Result};
use clap::Parser;
use streamrec_lib::commands::{self, Cli};
use streamrec_lib::config::resolve_config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    streamrec_lib::init_logging(cli.verbose);

    tracing::debug!("streamrec v{}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&cli.overrides()).context("Failed to resolve configuration")?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "loaded config file");
    }

    commands::dispatch(cli.command, config).await?;
    Ok(())
}
