//! Command-line arguments.
//!
//! Options that are also remembered in the settings file are optional here;
//! unset values fall back to the settings file and then to the defaults below.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use glam::DVec3;
use gtiles::RetryPolicy;
use gtiles_scene::ExportFormat;
use serde::{Deserialize, Serialize};

/// Default viewport center (New York City).
pub const DEFAULT_COORDS: Coords = Coords {
    lat: 40.7,
    lng: -74.0,
};
/// Default Web-Mercator zoom level.
pub const DEFAULT_ZOOM: f64 = 16.0;
/// Default screen-space error budget in pixels.
pub const DEFAULT_SSE: f64 = 8.0;
/// Delay before the first retry of a failed tile.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lng: f64,
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Parse a `lat,lng` string.
pub fn parse_coords(s: &str) -> Result<Coords, String> {
    let Some((lat, lng)) = s.split_once(',') else {
        return Err(format!("expected LAT,LNG, got '{s}'"));
    };
    let lat = lat
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid latitude: {e}"))?;
    let lng = lng
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid longitude: {e}"))?;

    if !(-90.0..=90.0).contains(&lat) {
        return Err(format!("latitude out of range: {lat}"));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(format!("longitude out of range: {lng}"));
    }
    Ok(Coords { lat, lng })
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Binary glTF, one file.
    #[default]
    Glb,
    /// Text glTF with a separate `.bin` buffer.
    Gltf,
}

impl From<OutputFormat> for ExportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Glb => ExportFormat::Binary,
            OutputFormat::Gltf => ExportFormat::Text,
        }
    }
}

/// Which axis points up in the exported scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UpAxis {
    /// glTF convention.
    #[default]
    Y,
    Z,
}

impl UpAxis {
    #[must_use]
    pub fn vector(self) -> DVec3 {
        match self {
            UpAxis::Y => DVec3::Y,
            UpAxis::Z => DVec3::Z,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "gtiles-fetch",
    version,
    about = "Fetch Google photorealistic 3D Tiles around a location and export them as glTF"
)]
pub struct Cli {
    /// Google Maps Platform API key with the Map Tiles API enabled.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Viewport center as LAT,LNG in degrees.
    #[arg(long, value_parser = parse_coords, allow_hyphen_values = true)]
    pub coords: Option<Coords>,

    /// Web-Mercator zoom level of the viewport.
    #[arg(long)]
    pub zoom: Option<f64>,

    /// Viewport width in pixels.
    #[arg(long, default_value_t = 230)]
    pub width: u32,

    /// Viewport height in pixels.
    #[arg(long, default_value_t = 175)]
    pub height: u32,

    /// Target screen-space error; smaller fetches more detail.
    #[arg(long)]
    pub sse: Option<f64>,

    /// Root tileset to traverse.
    #[arg(long, default_value = gtiles::DEFAULT_TILESET_URL)]
    pub tileset_url: String,

    /// Output directory.
    #[arg(long, default_value = "tiles")]
    pub out: PathBuf,

    /// Output format of the merged scene.
    #[arg(long, value_enum, default_value_t = OutputFormat::default())]
    pub format: OutputFormat,

    /// Write each tile as its own `.glb` instead of a merged scene.
    #[arg(long)]
    pub tiles_only: bool,

    /// Export only the first N tiles (finest first).
    #[arg(long)]
    pub limit: Option<usize>,

    /// Up axis of the merged scene.
    #[arg(long, value_enum, default_value_t = UpAxis::default())]
    pub up: UpAxis,

    /// Seconds to wait for the traversal to converge; 0 waits forever.
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Extra attempts for each tile after a transient failure.
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Do not remember this run's key, location and budget.
    #[arg(long)]
    pub no_save: bool,

    /// Settings file to use instead of the per-user default.
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

impl Cli {
    /// Deadline for tile selection, `None` to wait indefinitely.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retries.saturating_add(1),
            backoff: RETRY_BACKOFF,
        }
    }
}
