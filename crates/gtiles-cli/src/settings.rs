//! Persisted settings and run configuration.
//!
//! The settings file remembers the API key, the last location, zoom and
//! budget, and how many tiles the last run produced. Command-line values
//! override it.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::{Cli, Coords, DEFAULT_COORDS, DEFAULT_SSE, DEFAULT_ZOOM};
use crate::error::{CliError, Result};

/// Contents of `settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: Option<String>,
    pub coords: Option<Coords>,
    pub zoom: Option<f64>,
    pub sse: Option<f64>,
    pub tile_count: Option<usize>,
}

impl Settings {
    /// `<config dir>/gtiles/settings.json`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gtiles").join("settings.json"))
    }

    /// Load settings, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(CliError::io(path, e)),
        };
        serde_json::from_slice(&data)
            .map_err(|e| CliError::Settings(format!("{}: {e}", path.display())))
    }

    /// Save settings, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CliError::io(parent, e))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| CliError::Settings(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, data).map_err(|e| CliError::io(&temp_path, e))?;
        std::fs::rename(&temp_path, path).map_err(|e| CliError::io(path, e))?;
        Ok(())
    }

    /// Remember the values used by a successful run.
    pub fn remember(&mut self, config: &RunConfig, tile_count: usize) {
        self.api_key = Some(config.api_key.clone());
        self.coords = Some(config.coords);
        self.zoom = Some(config.zoom);
        self.sse = Some(config.sse);
        self.tile_count = Some(tile_count);
    }
}

/// Values for one run after merging arguments, settings and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub api_key: String,
    pub coords: Coords,
    pub zoom: f64,
    pub sse: f64,
}

impl RunConfig {
    /// Resolve the run configuration. A missing API key is an error.
    pub fn resolve(cli: &Cli, settings: &Settings) -> Result<Self> {
        let api_key = cli
            .api_key
            .clone()
            .or_else(|| settings.api_key.clone())
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                CliError::Config(
                    "an API key is required. \
                     Pass --api-key or set GOOGLE_API_KEY"
                        .to_string(),
                )
            })?;

        Ok(Self {
            api_key,
            coords: cli.coords.or(settings.coords).unwrap_or(DEFAULT_COORDS),
            zoom: cli.zoom.or(settings.zoom).unwrap_or(DEFAULT_ZOOM),
            sse: cli.sse.or(settings.sse).unwrap_or(DEFAULT_SSE),
        })
    }
}
