//! `streamrec record`: one manual session in the foreground

use crate::config::Config;
use crate::recorder::SessionRegistry;
use crate::utils::error::AppResult;
use crate::utils::slug::slugify;
use std::sync::Arc;
use std::time::Duration;
use tracing::info_span;

pub async fn record(
    config: Config,
    identity: &str,
    source_locator: &str,
    display_name: Option<&str>,
) -> AppResult<()> {
    let slug = slugify(identity);
    // Keep what the user typed as the display name
    let display_name = display_name
        .map(str::to_string)
        .or_else(|| (slug != identity).then(|| identity.to_string()));

    let registry = Arc::new(SessionRegistry::new(
        config.layout(),
        config.encoder(),
        config.stop_timeouts(),
        info_span!("registry"),
    )?);

    let session = {
        let registry = registry.clone();
        let locator = source_locator.to_string();
        let slug = slug.clone();
        tokio::task::spawn_blocking(move || registry.start(&slug, &locator, display_name.as_deref()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??
    };

    println!("Recording {} ({})", slug, session.id());
    println!("  archive: {}", session.archive_path().display());
    println!("  preview: {}", session.live_preview_path().display());

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    tokio::select! {
        _ = super::shutdown_signal() => {}
        _ = async {
            loop {
                poll.tick().await;
                if !session.is_process_alive() {
                    break;
                }
            }
        } => {
            tracing::info!("encoder exited");
        }
    }

    let id = session.id().clone();
    let stopper = registry.clone();
    tokio::task::spawn_blocking(move || stopper.stop(&id))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    println!(
        "Stopped ({}), {} bytes archived",
        session.state(),
        session.bytes_written()
    );
    Ok(())
}
