//! Application state and the fetch/export workflow.
//!
//! [`AppState`] owns the viewport, the current selection and the downloaded
//! fragments. Every operation takes it explicitly; progress is published on a
//! watch channel that the logging UI subscribes to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gtiles::{
    Cache, Client, RetryPolicy, ScreenSpaceError, Selection, SelectionState, TileSelector,
    Tileset3d, TilesetTraversal, ViewportSpec,
};
use gtiles_scene::{ExportFormat, Exported, GlbDocument, MeshFragment, SceneNormalizer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CliError, Result};

/// What the application is doing.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Idle,
    Selecting(SelectionState),
    Downloading { done: usize, total: usize },
    Ready { fragments: usize },
    Exported { path: PathBuf },
}

/// A selected tile that did not make it into the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub content_url: String,
    pub reason: String,
}

pub struct AppState {
    viewport: ViewportSpec,
    target: ScreenSpaceError,
    selection: Option<Selection>,
    /// Earth-centered fragments in selection order.
    fragments: Vec<MeshFragment<GlbDocument>>,
    failures: Vec<Failure>,
    visible: usize,
    events: watch::Sender<AppEvent>,
}

impl AppState {
    #[must_use]
    pub fn new(viewport: ViewportSpec, target: ScreenSpaceError) -> Self {
        let (events, _) = watch::channel(AppEvent::Idle);
        Self {
            viewport,
            target,
            selection: None,
            fragments: Vec::new(),
            failures: Vec::new(),
            visible: 0,
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AppEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    #[must_use]
    pub fn fragments(&self) -> &[MeshFragment<GlbDocument>] {
        &self.fragments
    }

    #[must_use]
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    #[must_use]
    pub fn visible(&self) -> usize {
        self.visible
    }

    /// Load the tileset at `tileset_url` and fetch the tiles for the viewport.
    ///
    /// Returns the number of fragments now held.
    pub async fn fetch<C: Cache>(
        &mut self,
        client: Arc<Client<C>>,
        tileset_url: &str,
        selector: &TileSelector,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut tileset =
            Tileset3d::load(Arc::clone(&client), tileset_url, self.target.get()).await?;
        self.fetch_with(&client, &mut tileset, selector, retry, cancel)
            .await
    }

    /// Select with `traversal`, download and decode, replacing all fragments.
    pub async fn fetch_with<C: Cache, T: TilesetTraversal + ?Sized>(
        &mut self,
        client: &Client<C>,
        traversal: &mut T,
        selector: &TileSelector,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        tracing::info!(
            lat = self.viewport.latitude(),
            lng = self.viewport.longitude(),
            zoom = self.viewport.zoom(),
            sse = self.target.get(),
            "fetching tiles"
        );

        let selection = self.select(selector, traversal).await?;
        let total = selection.tiles.len();
        tracing::info!("{total} tiles selected");

        self.events
            .send_replace(AppEvent::Downloading { done: 0, total });
        let events = &self.events;
        let report = client
            .download_tiles_with_progress(&selection.tiles, retry, cancel, |done, total| {
                events.send_replace(AppEvent::Downloading { done, total });
            })
            .await;
        if report.cancelled {
            self.events.send_replace(AppEvent::Idle);
            return Err(gtiles::Error::Cancelled.into());
        }

        let mut failures: Vec<Failure> = report
            .failed
            .into_iter()
            .map(|failed| Failure {
                content_url: failed.content_url,
                reason: failed.error.to_string(),
            })
            .collect();

        let mut fragments = Vec::with_capacity(report.downloaded.len());
        for tile in report.downloaded {
            let url = tile.descriptor.content_url;
            match GlbDocument::from_slice(&tile.data) {
                Ok(document) => fragments.push(MeshFragment::new(url, document)),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "failed to decode tile, skipping");
                    failures.push(Failure {
                        content_url: url,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.selection = Some(selection);
        self.visible = fragments.len();
        self.fragments = fragments;
        self.failures = failures;

        self.events.send_replace(AppEvent::Ready {
            fragments: self.visible,
        });
        Ok(self.fragments.len())
    }

    async fn select<T: TilesetTraversal + ?Sized>(
        &self,
        selector: &TileSelector,
        traversal: &mut T,
    ) -> Result<Selection> {
        let mut states = selector.subscribe();
        let done = CancellationToken::new();

        let select = async {
            let result = selector
                .select_tiles(&self.viewport, self.target, traversal)
                .await;
            done.cancel();
            result
        };
        let forward = async {
            loop {
                tokio::select! {
                    biased;
                    () = done.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        self.events.send_replace(AppEvent::Selecting(state));
                    }
                }
            }
        };

        let (result, ()) = tokio::join!(select, forward);
        self.events
            .send_replace(AppEvent::Selecting(selector.state()));
        result.map_err(CliError::from)
    }

    /// Show only the first `count` fragments. Returns the count applied.
    pub fn set_visible(&mut self, count: usize) -> usize {
        self.visible = count.min(self.fragments.len());
        self.events.send_replace(AppEvent::Ready {
            fragments: self.visible,
        });
        self.visible
    }

    /// Normalize and merge the visible fragments, then write them to `dir`.
    ///
    /// Returns the path of the main output file.
    pub async fn export(
        &self,
        normalizer: &SceneNormalizer,
        dir: &Path,
        stem: &str,
        format: ExportFormat,
    ) -> Result<PathBuf> {
        let visible: Vec<_> = self.fragments[..self.visible]
            .iter()
            .map(MeshFragment::borrowed)
            .collect();
        let scene = normalizer.normalize(visible)?;
        let merged = gtiles_scene::merge_scene(&scene)?;
        tracing::info!(
            fragments = scene.fragments.len(),
            center = %scene.center,
            size = scene.size,
            "merged scene"
        );

        let path = dir.join(format!("{stem}.{}", format.extension()));
        match gtiles_scene::export(&merged, format, stem)? {
            Exported::Binary(bytes) => write_file(&path, bytes).await?,
            Exported::Text {
                json,
                bin,
                bin_name,
            } => {
                write_file(&path, json.into_bytes()).await?;
                write_file(&dir.join(bin_name), bin).await?;
            }
        }

        self.events
            .send_replace(AppEvent::Exported { path: path.clone() });
        Ok(path)
    }

    /// Write each visible fragment to `dir/{index}.glb`, untransformed.
    pub async fn write_tiles(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(self.visible);
        for (index, fragment) in self.fragments[..self.visible].iter().enumerate() {
            let path = dir.join(format!("{index}.glb"));
            write_file(&path, fragment.geometry.to_glb_bytes()?).await?;
            paths.push(path);
        }
        if let Some(last) = paths.last() {
            self.events
                .send_replace(AppEvent::Exported { path: last.clone() });
        }
        Ok(paths)
    }
}

async fn write_file(path: &Path, data: Vec<u8>) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .map_err(|e| CliError::io(path, e))
}

/// Log every application event until the state is dropped.
pub fn spawn_log_ui(mut events: watch::Receiver<AppEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while events.changed().await.is_ok() {
            let event = events.borrow_and_update().clone();
            match event {
                AppEvent::Idle => tracing::info!("idle"),
                AppEvent::Selecting(SelectionState::Pending) => {
                    tracing::info!("selecting tiles...");
                }
                AppEvent::Selecting(SelectionState::Partial { passes, discovered }) => {
                    tracing::debug!(passes, discovered, "traversal in progress");
                }
                AppEvent::Selecting(SelectionState::Converged { passes, discovered }) => {
                    tracing::info!("traversal converged after {passes} passes, {discovered} tiles");
                }
                AppEvent::Selecting(SelectionState::TimedOut { passes, discovered }) => {
                    tracing::warn!("traversal timed out after {passes} passes, {discovered} tiles");
                }
                AppEvent::Selecting(SelectionState::Cancelled) => tracing::warn!("selection cancelled"),
                AppEvent::Downloading { done, total } => {
                    tracing::debug!(done, total, "downloading");
                }
                AppEvent::Ready { fragments } => tracing::info!("{fragments} tiles ready"),
                AppEvent::Exported { path } => tracing::info!("wrote {}", path.display()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtiles::MemoryCache;
    use gtiles::traversal::{DiscoveredTile, TraversalFuture};
    use serde_json::json;

    /// Converges on the first pass with a fixed set of tiles.
    struct FixedTraversal {
        tiles: Vec<DiscoveredTile>,
        loaded: bool,
    }

    impl TilesetTraversal for FixedTraversal {
        fn select_tiles<'a>(&'a mut self, _viewport: &'a ViewportSpec) -> TraversalFuture<'a> {
            self.loaded = true;
            Box::pin(async { Ok(()) })
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }

        fn tiles(&self) -> &[DiscoveredTile] {
            &self.tiles
        }

        fn query_params(&self) -> &str {
            "session=s"
        }
    }

    fn tile_glb(offset: [f64; 3]) -> Vec<u8> {
        let mut bin = Vec::new();
        for v in [[0.0f32, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]] {
            for c in v {
                bin.extend_from_slice(&c.to_le_bytes());
            }
        }
        let json = json!({
            "asset": { "version": "2.0" },
            "scenes": [{ "nodes": [0] }],
            "nodes": [{ "mesh": 0, "translation": offset }],
            "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 } }] }],
            "accessors": [{
                "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
                "min": [0.0, 0.0, 0.0], "max": [10.0, 10.0, 0.0]
            }],
            "bufferViews": [{ "buffer": 0, "byteLength": 36 }],
            "buffers": [{ "byteLength": 36 }]
        });
        GlbDocument::from_parts(json, bin)
            .unwrap()
            .to_glb_bytes()
            .unwrap()
    }

    fn discovered(url: &str, error: f64) -> DiscoveredTile {
        DiscoveredTile {
            content_url: url.to_string(),
            geometric_error: error,
            depth: 1,
        }
    }

    fn seeded_client() -> Client<MemoryCache> {
        let cache = MemoryCache::new();
        cache.insert(
            "https://tiles.test/a.glb?session=s",
            tile_glb([1_334_000.0, -4_654_000.0, 4_138_000.0]),
        );
        cache.insert(
            "https://tiles.test/b.glb?session=s",
            tile_glb([1_334_020.0, -4_654_000.0, 4_138_000.0]),
        );
        cache.insert("https://tiles.test/broken.glb?session=s", b"garbage".to_vec());
        Client::with_cache("secret", cache)
    }

    fn state() -> AppState {
        AppState::new(
            ViewportSpec::new(230, 175, 40.7, -74.0, 16.0).unwrap(),
            ScreenSpaceError::new(8.0).unwrap(),
        )
    }

    async fn fetched_state() -> AppState {
        let client = seeded_client();
        let mut traversal = FixedTraversal {
            tiles: vec![
                discovered("https://tiles.test/b.glb", 4.0),
                discovered("https://tiles.test/a.glb", 2.0),
                discovered("https://tiles.test/broken.glb", 3.0),
                discovered("https://tiles.test/coarse.glb", 40.0),
            ],
            loaded: false,
        };
        let mut state = state();
        let count = state
            .fetch_with(
                &client,
                &mut traversal,
                &TileSelector::new(),
                &RetryPolicy::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
        state
    }

    #[tokio::test]
    async fn test_fetch_replaces_fragments_and_records_failures() {
        let state = fetched_state().await;

        let sources: Vec<&str> = state.fragments().iter().map(|f| f.source.as_str()).collect();
        assert_eq!(sources, vec!["https://tiles.test/a.glb", "https://tiles.test/b.glb"]);
        assert_eq!(state.visible(), 2);

        assert_eq!(state.failures().len(), 1);
        assert_eq!(state.failures()[0].content_url, "https://tiles.test/broken.glb");
        assert_eq!(state.selection().map(|s| s.tiles.len()), Some(3));
        assert_eq!(*state.subscribe().borrow(), AppEvent::Ready { fragments: 2 });
    }

    #[tokio::test]
    async fn test_set_visible_clamps() {
        let mut state = fetched_state().await;
        assert_eq!(state.set_visible(1), 1);
        assert_eq!(state.set_visible(50), 2);
    }

    #[tokio::test]
    async fn test_export_binary_scene() {
        let mut state = fetched_state().await;
        state.set_visible(1);
        let dir = tempfile::tempdir().unwrap();

        let path = state
            .export(&SceneNormalizer::default(), dir.path(), "scene", ExportFormat::Binary)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("scene.glb"));

        let document = GlbDocument::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        // One tile node plus one wrapper.
        assert_eq!(document.json()["nodes"].as_array().map(Vec::len), Some(2));
        assert!(document.bounds().center().length() < 1e-6);
        assert_eq!(
            *state.subscribe().borrow(),
            AppEvent::Exported { path: path.clone() }
        );
    }

    #[tokio::test]
    async fn test_export_text_scene_writes_sidecar() {
        let state = fetched_state().await;
        let dir = tempfile::tempdir().unwrap();
        let path = state
            .export(&SceneNormalizer::default(), dir.path(), "scene", ExportFormat::Text)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("scene.gltf"));
        assert_eq!(std::fs::read(dir.path().join("scene.bin")).unwrap().len(), 72);
    }

    #[tokio::test]
    async fn test_write_tiles() {
        let state = fetched_state().await;
        let dir = tempfile::tempdir().unwrap();
        let paths = state.write_tiles(dir.path()).await.unwrap();
        assert_eq!(paths, vec![dir.path().join("0.glb"), dir.path().join("1.glb")]);
        assert!(GlbDocument::from_slice(&std::fs::read(&paths[1]).unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_keeps_previous_fragments() {
        let mut state = fetched_state().await;
        let client = seeded_client();
        let mut traversal = FixedTraversal {
            tiles: vec![discovered("https://tiles.test/a.glb", 2.0)],
            loaded: false,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = state
            .fetch_with(
                &client,
                &mut traversal,
                &TileSelector::new().with_cancellation(cancel.clone()),
                &RetryPolicy::none(),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(CliError::Tiles(gtiles::Error::Cancelled))));
        assert_eq!(state.fragments().len(), 2);
    }

    #[tokio::test]
    async fn test_export_without_fragments_fails() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        let result = state
            .export(&SceneNormalizer::default(), dir.path(), "scene", ExportFormat::Binary)
            .await;
        assert!(matches!(
            result,
            Err(CliError::Scene(gtiles_scene::SceneError::EmptyScene))
        ));
    }
}
