//! Tileset traversal.
//!
//! [`TilesetTraversal`] is the seam between tile selection and whatever walks
//! the tile hierarchy. [`Tileset3d`] is the HTTP-backed implementation: each
//! call to `select_tiles` performs one traversal pass over the visible part of
//! the hierarchy and then fetches the external tilesets that pass uncovered,
//! one at a time. It reports itself loaded once a pass finds nothing left to
//! fetch.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use glam::DMat4;
use reqwest::Url;

use crate::cache::{Cache, NoCache};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::tileset::{BoundingVolume, Refine, TileJson, TilesetJson, transform_matrix};
use crate::viewport::{ViewCamera, ViewportSpec};

/// Future returned by [`TilesetTraversal::select_tiles`].
pub type TraversalFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A renderable tile found during traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTile {
    /// Absolute content URL without query parameters.
    pub content_url: String,
    /// Geometric error in meters; finite and non-negative.
    pub geometric_error: f64,
    /// Depth in the combined tile hierarchy (root is 0).
    pub depth: u32,
}

/// Something that can walk a tileset for a viewport.
pub trait TilesetTraversal: Send {
    /// Run one traversal pass for `viewport`, awaiting any fetches it needs.
    fn select_tiles<'a>(&'a mut self, viewport: &'a ViewportSpec) -> TraversalFuture<'a>;

    /// Whether the last pass found nothing left to fetch.
    fn is_loaded(&self) -> bool;

    /// Every renderable tile discovered so far, in discovery order.
    fn tiles(&self) -> &[DiscoveredTile];

    /// Query parameters the service expects on follow-up requests, e.g. `session=...`.
    fn query_params(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExternalState {
    Unloaded,
    Loaded,
    Failed,
}

#[derive(Debug, Clone)]
enum TileContent {
    Empty,
    Renderable(String),
    External { url: String, state: ExternalState },
}

#[derive(Debug, Clone)]
struct TileNode {
    volume: BoundingVolume,
    geometric_error: f64,
    refine: Refine,
    content: TileContent,
    transform: DMat4,
    children: Vec<usize>,
    depth: u32,
}

/// Where a subtree gets attached while grafting.
#[derive(Debug, Clone, Copy)]
struct Parent {
    index: usize,
    transform: DMat4,
    refine: Refine,
    depth: u32,
}

/// An HTTP-backed 3D Tiles traversal.
pub struct Tileset3d<C: Cache = NoCache> {
    client: Arc<Client<C>>,
    nodes: Vec<TileNode>,
    maximum_screen_space_error: f64,
    /// Raw `name=value` pairs, last value wins.
    params: Vec<String>,
    query_params: String,
    discovered: Vec<DiscoveredTile>,
    seen: HashSet<String>,
    loaded: bool,
    passes: u32,
}

impl<C: Cache> Tileset3d<C> {
    /// Fetch the root tileset at `url` and prepare for traversal.
    pub async fn load(
        client: Arc<Client<C>>,
        url: &str,
        maximum_screen_space_error: f64,
    ) -> Result<Self> {
        tracing::info!(url, "fetching tileset");
        let json = client.fetch_tileset(url, "").await?;
        let mut tileset = Self::empty(client, maximum_screen_space_error);
        if let Some((_, query)) = url.split_once('?') {
            tileset.merge_query(query);
        }
        tileset.graft(None, url, &json)?;
        Ok(tileset)
    }

    /// Build a traversal from an already parsed root tileset.
    pub fn from_json(
        client: Arc<Client<C>>,
        url: &str,
        json: &TilesetJson,
        maximum_screen_space_error: f64,
    ) -> Result<Self> {
        let mut tileset = Self::empty(client, maximum_screen_space_error);
        tileset.graft(None, url, json)?;
        Ok(tileset)
    }

    fn empty(client: Arc<Client<C>>, maximum_screen_space_error: f64) -> Self {
        Self {
            client,
            nodes: Vec::new(),
            maximum_screen_space_error,
            params: Vec::new(),
            query_params: String::new(),
            discovered: Vec::new(),
            seen: HashSet::new(),
            loaded: false,
            passes: 0,
        }
    }

    /// Number of traversal passes performed so far.
    #[must_use]
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Number of tiles in the hierarchy loaded so far.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn merge_query(&mut self, query: &str) {
        let name_of = |pair: &str| pair.split_once('=').map_or(pair, |(name, _)| name).to_string();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let name = name_of(pair);
            if name == "key" {
                continue;
            }
            match self.params.iter_mut().find(|p| name_of(p) == name) {
                Some(existing) => *existing = pair.to_string(),
                None => self.params.push(pair.to_string()),
            }
        }
        self.query_params = self.params.join("&");
    }

    /// Insert the root of `json` (fetched from `base_url`) below `parent`.
    fn graft(&mut self, parent: Option<Parent>, base_url: &str, json: &TilesetJson) -> Result<()> {
        let base = Url::parse(base_url).map_err(|e| Error::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;

        let parent_for_root = parent.unwrap_or(Parent {
            index: usize::MAX,
            transform: DMat4::IDENTITY,
            refine: Refine::Replace,
            depth: 0,
        });
        let root = self.insert(&json.root, &base, parent_for_root, parent.is_none())?;

        if let Some(parent) = parent {
            self.nodes[parent.index].children.push(root);
        }
        Ok(())
    }

    fn insert(&mut self, tile: &TileJson, base: &Url, parent: Parent, is_root: bool) -> Result<usize> {
        if !tile.geometric_error.is_finite() || tile.geometric_error < 0.0 {
            return Err(Error::InvalidData {
                context: "tile",
                detail: format!("geometric error {} is not a non-negative number", tile.geometric_error),
            });
        }

        let transform = parent.transform * transform_matrix(tile.transform.as_ref());
        let volume = BoundingVolume::from_json(&tile.bounding_volume, &transform)?;
        let content = match tile.content.as_ref().and_then(|c| c.uri()) {
            Some(uri) => self.resolve_content(base, uri)?,
            None => TileContent::Empty,
        };
        let depth = if is_root { 0 } else { parent.depth + 1 };
        let refine = tile.refine.unwrap_or(parent.refine);

        let index = self.nodes.len();
        self.nodes.push(TileNode {
            volume,
            geometric_error: tile.geometric_error,
            refine,
            content,
            transform,
            children: Vec::with_capacity(tile.children.len()),
            depth,
        });

        let this = Parent {
            index,
            transform,
            refine,
            depth,
        };
        for child in &tile.children {
            let child = self.insert(child, base, this, false)?;
            self.nodes[index].children.push(child);
        }

        Ok(index)
    }

    fn resolve_content(&mut self, base: &Url, uri: &str) -> Result<TileContent> {
        let mut url = base.join(uri).map_err(|e| Error::InvalidUrl {
            url: uri.to_string(),
            message: e.to_string(),
        })?;

        if let Some(query) = url.query().map(str::to_string) {
            self.merge_query(&query);
        }
        url.set_query(None);
        url.set_fragment(None);

        let is_tileset = url.path().to_ascii_lowercase().ends_with(".json");
        let url = url.to_string();
        Ok(if is_tileset {
            TileContent::External {
                url,
                state: ExternalState::Unloaded,
            }
        } else {
            TileContent::Renderable(url)
        })
    }

    /// Walk the visible hierarchy, recording renderable tiles.
    ///
    /// Returns the external tilesets that need fetching.
    fn walk(&mut self, camera: &ViewCamera) -> Vec<usize> {
        let frustum = camera.frustum();
        let lod = camera.lod_metrics();
        let mut pending = Vec::new();

        if self.nodes.is_empty() {
            return pending;
        }

        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !frustum.intersects(&node.volume) {
                continue;
            }

            let needs_detail =
                lod.tile_error(node.geometric_error, &node.volume) > self.maximum_screen_space_error;

            let refine = match &node.content {
                TileContent::External {
                    state: ExternalState::Unloaded,
                    ..
                } => {
                    pending.push(index);
                    false
                }
                // A loaded external tileset only holds its subtree.
                TileContent::External { .. } => true,
                TileContent::Renderable(url) => {
                    if self.seen.insert(url.clone()) {
                        self.discovered.push(DiscoveredTile {
                            content_url: url.clone(),
                            geometric_error: node.geometric_error,
                            depth: node.depth,
                        });
                    }
                    needs_detail
                }
                TileContent::Empty => needs_detail,
            };

            if refine {
                stack.extend(self.nodes[index].children.iter().rev());
            }
        }

        pending
    }

    async fn load_external(&mut self, index: usize) {
        let TileContent::External { url, .. } = &self.nodes[index].content else {
            return;
        };
        let url = url.clone();
        let client = Arc::clone(&self.client);

        let state = match client.fetch_tileset(&url, &self.query_params).await {
            Ok(json) => {
                let node = &self.nodes[index];
                let parent = Parent {
                    index,
                    transform: node.transform,
                    refine: node.refine,
                    depth: node.depth,
                };
                match self.graft(Some(parent), &url, &json) {
                    Ok(()) => ExternalState::Loaded,
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "skipping malformed external tileset");
                        ExternalState::Failed
                    }
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "failed to fetch external tileset");
                ExternalState::Failed
            }
        };

        if let TileContent::External { state: slot, .. } = &mut self.nodes[index].content {
            *slot = state;
        }
    }

    async fn run_pass(&mut self, viewport: ViewportSpec) -> Result<()> {
        let pending = self.walk(&viewport.camera());
        self.passes += 1;
        self.loaded = pending.is_empty();

        tracing::debug!(
            pass = self.passes,
            pending = pending.len(),
            discovered = self.discovered.len(),
            "traversal pass"
        );

        for index in pending {
            self.load_external(index).await;
        }
        Ok(())
    }
}

impl<C: Cache> TilesetTraversal for Tileset3d<C> {
    fn select_tiles<'a>(&'a mut self, viewport: &'a ViewportSpec) -> TraversalFuture<'a> {
        Box::pin(self.run_pass(*viewport))
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn tiles(&self) -> &[DiscoveredTile] {
        &self.discovered
    }

    fn query_params(&self) -> &str {
        &self.query_params
    }
}
