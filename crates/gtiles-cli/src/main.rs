//! Fetch Google photorealistic 3D Tiles for a map viewport.
//!
//! Selects the tiles whose geometric error matches a screen-space error
//! budget, downloads them, and writes either one normalized glTF scene or the
//! individual tiles.

mod app;
mod cli;
mod error;
mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gtiles::{Client, FilterOutcome, NoCache, ScreenSpaceError, TileSelector, ViewportSpec};
use gtiles_scene::SceneNormalizer;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::cli::Cli;
use crate::error::{CliError, Result};
use crate::settings::{RunConfig, Settings};

/// File stem of the merged scene.
const SCENE_STEM: &str = "scene";

#[tokio::main]
async fn main() -> ExitCode {
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings_path = cli.settings.clone().or_else(Settings::default_path);
    let mut settings = match &settings_path {
        Some(path) => Settings::load(path).unwrap_or_else(|e| {
            tracing::warn!("ignoring settings: {e}");
            Settings::default()
        }),
        None => Settings::default(),
    };
    if let Some(count) = settings.tile_count {
        tracing::debug!("previous run produced {count} tiles");
    }

    // Configuration problems stop us before any request is made.
    let config = RunConfig::resolve(&cli, &settings)?;
    let viewport = ViewportSpec::new(
        cli.width,
        cli.height,
        config.coords.lat,
        config.coords.lng,
        config.zoom,
    )
    .map_err(|e| CliError::Config(e.to_string()))?;
    let target = ScreenSpaceError::new(config.sse).map_err(|e| CliError::Config(e.to_string()))?;
    let normalizer = SceneNormalizer::new(cli.up.vector())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let client = Arc::new(run_client(&config));
    let mut selector = TileSelector::new().with_cancellation(cancel.clone());
    if let Some(deadline) = cli.deadline() {
        selector = selector.with_deadline(deadline);
    }

    let mut state = AppState::new(viewport, target);
    let ui = app::spawn_log_ui(state.subscribe());

    let count = state
        .fetch(client, &cli.tileset_url, &selector, &cli.retry_policy(), &cancel)
        .await?;
    report(&state);

    if let Some(limit) = cli.limit {
        state.set_visible(limit);
    }

    tokio::fs::create_dir_all(&cli.out)
        .await
        .map_err(|e| CliError::io(&cli.out, e))?;
    if cli.tiles_only {
        let paths = state.write_tiles(&cli.out).await?;
        tracing::info!("wrote {} tiles to {}", paths.len(), cli.out.display());
    } else {
        state
            .export(&normalizer, &cli.out, SCENE_STEM, cli.format.into())
            .await?;
    }

    if let Some(path) = settings_path.filter(|_| !cli.no_save) {
        settings.remember(&config, count);
        if let Err(e) = settings.save(&path) {
            tracing::warn!("could not save settings: {e}");
        }
    }

    drop(state);
    let _ = ui.await;
    Ok(())
}

/// HTTP client for one run.
///
/// Nothing is requested twice within a run and the fragments already hold
/// every tile body, so responses are not cached.
fn run_client(config: &RunConfig) -> Client<NoCache> {
    Client::new(config.api_key.clone())
}

/// Summarize the selection and any tiles that were skipped.
fn report(state: &AppState) {
    if let Some(selection) = state.selection() {
        if let FilterOutcome::Widened {
            first_error,
            threshold,
        } = selection.filter
        {
            tracing::info!(
                "no tiles matched the budget, used tiles within {threshold} of it (2x {first_error})"
            );
        }
        if selection.capped {
            tracing::info!("selection was capped at {} tiles", selection.tiles.len());
        }
        if !selection.converged {
            tracing::info!(
                "selection is partial: {} of the discovered tiles were considered",
                selection.discovered
            );
        }
    }
    for failure in state.failures() {
        tracing::warn!("skipped {}: {}", failure.content_url, failure.reason);
    }
    tracing::info!(
        "{} tiles downloaded, {} skipped",
        state.fragments().len(),
        state.failures().len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::DEFAULT_COORDS;

    #[test]
    fn test_run_client_does_not_cache() {
        let config = RunConfig {
            api_key: "k".to_string(),
            coords: DEFAULT_COORDS,
            zoom: 16.0,
            sse: 8.0,
        };
        let client: Client<NoCache> = run_client(&config);
        assert_eq!(client.api_key(), "k");
    }
}
