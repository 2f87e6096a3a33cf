//! Async client and tile selection for Google's photorealistic 3D Tiles.
//!
//! This crate walks the 3D Tiles hierarchy for a rectangular map viewport,
//! picks the tiles whose geometric error best matches a screen-space error
//! budget, and downloads their content.
//!
//! # Design principles
//!
//! - **Key hygiene**: the API key never appears in logs, errors or cache keys
//! - **Pluggable traversal**: selection only needs a [`TilesetTraversal`]
//! - **Sequential fetching**: tilesets and tiles are fetched one at a time
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gtiles::{Client, ScreenSpaceError, TileSelector, Tileset3d, ViewportSpec};
//!
//! let client = Arc::new(Client::new(api_key));
//! let viewport = ViewportSpec::new(230, 175, 40.6891, -74.0445, 17.0)?;
//! let mut tileset = Tileset3d::load(client.clone(), gtiles::DEFAULT_TILESET_URL, 16.0).await?;
//!
//! let selection = TileSelector::new()
//!     .select_tiles(&viewport, ScreenSpaceError::new(8.0)?, &mut tileset)
//!     .await?;
//! ```

pub mod cache;
mod client;
mod download;
mod error;
pub mod selection;
pub mod tileset;
pub mod traversal;
pub mod viewport;

pub use cache::{Cache, MemoryCache, NoCache};
pub use client::{Client, DEFAULT_TILESET_URL, authorized_url, parse_query, redact};
pub use download::{DownloadReport, DownloadedTile, FailedTile, RetryPolicy};
pub use error::{Error, Result};
pub use selection::{
    FilterOutcome, MAX_SELECTED_TILES, Ranking, ScreenSpaceError, Selection, SelectionState,
    TileDescriptor, TileSelector, rank_tiles, session_key,
};
pub use traversal::{DiscoveredTile, Tileset3d, TilesetTraversal};
pub use viewport::{Frustum, LodMetrics, ViewCamera, ViewportSpec};
