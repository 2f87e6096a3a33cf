//! Tile selection by screen-space error.
//!
//! [`TileSelector`] drives a [`TilesetTraversal`] until it converges, then
//! ranks what was discovered:
//!
//! 1. sort ascending by geometric error (stable, ties keep discovery order)
//!    and drop repeated content URLs,
//! 2. keep tiles with `|target - error| <= target`,
//! 3. if that keeps nothing, widen to `|target - error| <= 2 * first_error`
//!    where `first_error` is the smallest discovered error,
//! 4. cap the result at [`MAX_SELECTED_TILES`].
//!
//! The widening in step 3 is a heuristic for coarse tilesets where nothing
//! sits near the requested budget. It can select far more than intended.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::client::parse_query;
use crate::error::{Error, Result};
use crate::traversal::{DiscoveredTile, TilesetTraversal};
use crate::viewport::ViewportSpec;

/// Upper bound on the number of tiles a selection returns.
pub const MAX_SELECTED_TILES: usize = 100;

/// Screen-space error budget in pixels. Smaller asks for more detail.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct ScreenSpaceError(f64);

impl ScreenSpaceError {
    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && value >= 0.0 {
            Ok(Self(value))
        } else {
            Err(Error::InvalidData {
                context: "screen space error",
                detail: format!("{value} is not a non-negative number"),
            })
        }
    }

    #[must_use]
    pub fn get(self) -> f64 {
        self.0
    }
}

/// A selected tile, ready to be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct TileDescriptor {
    /// Absolute content URL without query parameters.
    pub content_url: String,
    pub geometric_error: f64,
    /// Session token the service requires on content requests; may be empty.
    pub session_key: String,
}

impl TileDescriptor {
    /// `content_url?key=<api_key>&session=<session_key>`.
    pub fn request_url(&self, api_key: &str) -> Result<Url> {
        let mut url = Url::parse(&self.content_url).map_err(|e| Error::InvalidUrl {
            url: self.content_url.clone(),
            message: e.to_string(),
        })?;
        url.set_query(None);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("key", api_key);
            if !self.session_key.is_empty() {
                pairs.append_pair("session", &self.session_key);
            }
        }
        Ok(url)
    }
}

/// Which filter produced a ranking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterOutcome {
    /// Nothing was discovered.
    Empty,
    /// Tiles within the requested budget were found.
    Primary,
    /// The budget matched nothing and the threshold was widened.
    Widened { first_error: f64, threshold: f64 },
}

/// Result of sorting, de-duplicating, filtering and capping discovered tiles.
#[derive(Debug, Clone)]
pub struct Ranking {
    pub tiles: Vec<DiscoveredTile>,
    pub filter: FilterOutcome,
    /// True exactly when the cap removed tiles.
    pub capped: bool,
}

/// Rank discovered tiles for a budget.
#[must_use]
pub fn rank_tiles(tiles: &[DiscoveredTile], target: ScreenSpaceError) -> Ranking {
    let target = target.get();

    let mut sorted: Vec<&DiscoveredTile> = tiles.iter().collect();
    sorted.sort_by(|a, b| a.geometric_error.total_cmp(&b.geometric_error));
    let mut seen = HashSet::new();
    sorted.retain(|tile| seen.insert(tile.content_url.as_str()));

    let within = |threshold: f64| {
        sorted
            .iter()
            .filter(|tile| (target - tile.geometric_error).abs() <= threshold)
            .map(|&tile| tile.clone())
            .collect::<Vec<_>>()
    };

    let (mut selected, filter) = match sorted.first() {
        None => (Vec::new(), FilterOutcome::Empty),
        Some(first) => {
            let primary = within(target);
            if primary.is_empty() {
                let first_error = first.geometric_error;
                let threshold = 2.0 * first_error;
                (
                    within(threshold),
                    FilterOutcome::Widened {
                        first_error,
                        threshold,
                    },
                )
            } else {
                (primary, FilterOutcome::Primary)
            }
        }
    };

    let capped = selected.len() > MAX_SELECTED_TILES;
    selected.truncate(MAX_SELECTED_TILES);

    Ranking {
        tiles: selected,
        filter,
        capped,
    }
}

/// Extract the `session` parameter from a query string.
#[must_use]
pub fn session_key(query_params: &str) -> Option<String> {
    parse_query(query_params)
        .into_iter()
        .find_map(|(name, value)| (name == "session").then_some(value))
}

/// Progress of a selection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Pending,
    Partial { passes: u32, discovered: usize },
    Converged { passes: u32, discovered: usize },
    TimedOut { passes: u32, discovered: usize },
    Cancelled,
}

/// Outcome of [`TileSelector::select_tiles`].
#[derive(Debug, Clone)]
pub struct Selection {
    /// Ascending by geometric error, unique content URLs, at most [`MAX_SELECTED_TILES`].
    pub tiles: Vec<TileDescriptor>,
    pub capped: bool,
    pub filter: FilterOutcome,
    /// False when the deadline elapsed before the traversal converged.
    pub converged: bool,
    /// Number of tiles the traversal discovered before ranking.
    pub discovered: usize,
}

/// Runs a traversal to convergence and ranks the result.
///
/// Without a deadline the selector polls for as long as the traversal keeps
/// reporting unfinished work.
#[derive(Debug)]
pub struct TileSelector {
    deadline: Option<Duration>,
    cancel: CancellationToken,
    state: watch::Sender<SelectionState>,
}

impl Default for TileSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl TileSelector {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SelectionState::Pending);
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Give up waiting for convergence after `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive state transitions of subsequent runs.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SelectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> SelectionState {
        *self.state.borrow()
    }

    /// Select tiles for `viewport` at `target` screen-space error.
    pub async fn select_tiles<T: TilesetTraversal + ?Sized>(
        &self,
        viewport: &ViewportSpec,
        target: ScreenSpaceError,
        traversal: &mut T,
    ) -> Result<Selection> {
        self.state.send_replace(SelectionState::Pending);

        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut passes = 0;
        let mut reported = 0;

        let converged = loop {
            if traversal.is_loaded() {
                break true;
            }

            let pass = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                () = wait_until(deadline) => Some(None),
                result = traversal.select_tiles(viewport) => Some(Some(result)),
            };

            match pass {
                None => {
                    self.state.send_replace(SelectionState::Cancelled);
                    return Err(Error::Cancelled);
                }
                Some(None) => break false,
                Some(Some(result)) => result?,
            }

            passes += 1;
            let discovered = traversal.tiles().len();
            if discovered > reported {
                tracing::info!("{discovered} tiles discovered...");
                reported = discovered;
            }
            self.state
                .send_replace(SelectionState::Partial { passes, discovered });
        };

        let discovered = traversal.tiles().len();
        if converged {
            self.state
                .send_replace(SelectionState::Converged { passes, discovered });
        } else {
            self.state
                .send_replace(SelectionState::TimedOut { passes, discovered });
            if discovered == 0 {
                return Err(Error::TraversalStalled { passes, discovered });
            }
            tracing::warn!(
                passes,
                discovered,
                "traversal did not converge before the deadline, selecting from partial results"
            );
        }

        let session_key = session_key(traversal.query_params()).unwrap_or_else(|| {
            tracing::warn!("tileset did not provide a session key");
            String::new()
        });

        let ranking = rank_tiles(traversal.tiles(), target);
        if let FilterOutcome::Widened {
            first_error,
            threshold,
        } = ranking.filter
        {
            tracing::warn!(
                target = target.get(),
                first_error,
                threshold,
                "no tiles found for screen space error, widening to 2x the finest error"
            );
        }
        if ranking.capped {
            tracing::warn!("exceeded maximum tiles, capping at {MAX_SELECTED_TILES}");
        }

        let tiles = ranking
            .tiles
            .into_iter()
            .map(|tile| TileDescriptor {
                content_url: tile.content_url,
                geometric_error: tile.geometric_error,
                session_key: session_key.clone(),
            })
            .collect();

        Ok(Selection {
            tiles,
            capped: ranking.capped,
            filter: ranking.filter,
            converged,
            discovered,
        })
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traversal::TraversalFuture;
    use proptest::prelude::*;

    fn tile(url: &str, error: f64) -> DiscoveredTile {
        DiscoveredTile {
            content_url: url.to_string(),
            geometric_error: error,
            depth: 0,
        }
    }

    fn sse(value: f64) -> ScreenSpaceError {
        ScreenSpaceError::new(value).unwrap()
    }

    fn errors(ranking: &Ranking) -> Vec<f64> {
        ranking.tiles.iter().map(|t| t.geometric_error).collect()
    }

    fn viewport() -> ViewportSpec {
        ViewportSpec::new(230, 175, 40.7, -74.0, 17.0).unwrap()
    }

    /// Reveals one batch of tiles per pass and converges after the last one.
    struct ScriptedTraversal {
        batches: Vec<Vec<DiscoveredTile>>,
        tiles: Vec<DiscoveredTile>,
        query_params: String,
    }

    impl ScriptedTraversal {
        fn new(batches: Vec<Vec<DiscoveredTile>>) -> Self {
            Self {
                batches,
                tiles: Vec::new(),
                query_params: "session=s3ss".to_string(),
            }
        }
    }

    impl TilesetTraversal for ScriptedTraversal {
        fn select_tiles<'a>(&'a mut self, _viewport: &'a ViewportSpec) -> TraversalFuture<'a> {
            if !self.batches.is_empty() {
                let batch = self.batches.remove(0);
                self.tiles.extend(batch);
            }
            Box::pin(async { Ok(()) })
        }

        fn is_loaded(&self) -> bool {
            self.batches.is_empty()
        }

        fn tiles(&self) -> &[DiscoveredTile] {
            &self.tiles
        }

        fn query_params(&self) -> &str {
            &self.query_params
        }
    }

    /// Log output captured by a test subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Never finishes a pass.
    struct StalledTraversal {
        tiles: Vec<DiscoveredTile>,
    }

    impl TilesetTraversal for StalledTraversal {
        fn select_tiles<'a>(&'a mut self, _viewport: &'a ViewportSpec) -> TraversalFuture<'a> {
            Box::pin(std::future::pending())
        }

        fn is_loaded(&self) -> bool {
            false
        }

        fn tiles(&self) -> &[DiscoveredTile] {
            &self.tiles
        }

        fn query_params(&self) -> &str {
            ""
        }
    }

    #[test]
    fn test_primary_filter_scenario() {
        let tiles = [tile("a", 20.0), tile("b", 10.0), tile("c", 5.0), tile("d", 2.0)];
        let ranking = rank_tiles(&tiles, sse(8.0));
        assert_eq!(ranking.filter, FilterOutcome::Primary);
        assert_eq!(errors(&ranking), vec![2.0, 5.0, 10.0]);
        assert!(!ranking.capped);
    }

    #[test]
    fn test_widened_filter_scenario() {
        let tiles = [tile("a", 50.0), tile("b", 40.0)];
        let ranking = rank_tiles(&tiles, sse(1.0));
        assert_eq!(
            ranking.filter,
            FilterOutcome::Widened {
                first_error: 40.0,
                threshold: 80.0
            }
        );
        assert_eq!(errors(&ranking), vec![40.0, 50.0]);
    }

    #[test]
    fn test_ties_keep_discovery_order_and_dedupe() {
        let tiles = [
            tile("x", 4.0),
            tile("y", 4.0),
            tile("x", 2.0),
            tile("z", 4.0),
        ];
        let ranking = rank_tiles(&tiles, sse(4.0));
        let urls: Vec<&str> = ranking.tiles.iter().map(|t| t.content_url.as_str()).collect();
        // "x" survives at its finest error only.
        assert_eq!(urls, vec!["x", "y", "z"]);
        assert_eq!(errors(&ranking), vec![2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_empty_input() {
        let ranking = rank_tiles(&[], sse(8.0));
        assert_eq!(ranking.filter, FilterOutcome::Empty);
        assert!(ranking.tiles.is_empty());
        assert!(!ranking.capped);
    }

    #[test]
    fn test_cap_sets_flag_only_on_truncation() {
        let exact: Vec<_> = (0..100).map(|i| tile(&format!("t{i}"), 1.0)).collect();
        let ranking = rank_tiles(&exact, sse(1.0));
        assert_eq!(ranking.tiles.len(), 100);
        assert!(!ranking.capped);

        let over: Vec<_> = (0..150).map(|i| tile(&format!("t{i}"), 1.0)).collect();
        let ranking = rank_tiles(&over, sse(1.0));
        assert_eq!(ranking.tiles.len(), MAX_SELECTED_TILES);
        assert!(ranking.capped);
    }

    #[test]
    fn test_session_key() {
        assert_eq!(session_key("session=abc&v=1"), Some("abc".to_string()));
        assert_eq!(session_key("v=1"), None);
        assert_eq!(session_key(""), None);
    }

    #[test]
    fn test_request_url() {
        let descriptor = TileDescriptor {
            content_url: "https://tiles.test/files/a.glb".to_string(),
            geometric_error: 1.0,
            session_key: "abc".to_string(),
        };
        assert_eq!(
            descriptor.request_url("k").unwrap().as_str(),
            "https://tiles.test/files/a.glb?key=k&session=abc"
        );

        let no_session = TileDescriptor {
            session_key: String::new(),
            ..descriptor
        };
        assert_eq!(
            no_session.request_url("k").unwrap().as_str(),
            "https://tiles.test/files/a.glb?key=k"
        );
    }

    #[test]
    fn test_budget_validation() {
        assert!(ScreenSpaceError::new(-1.0).is_err());
        assert!(ScreenSpaceError::new(f64::INFINITY).is_err());
        assert!(ScreenSpaceError::new(0.0).is_ok());
    }

    #[tokio::test]
    async fn test_selector_polls_until_converged() {
        let mut traversal = ScriptedTraversal::new(vec![
            vec![tile("https://t/a.glb", 20.0)],
            vec![tile("https://t/b.glb", 10.0), tile("https://t/c.glb", 5.0)],
            vec![tile("https://t/d.glb", 2.0)],
        ]);
        let selector = TileSelector::new();
        let states = selector.subscribe();

        let selection = selector
            .select_tiles(&viewport(), sse(8.0), &mut traversal)
            .await
            .unwrap();

        assert!(selection.converged);
        assert_eq!(selection.discovered, 4);
        let found: Vec<f64> = selection.tiles.iter().map(|t| t.geometric_error).collect();
        assert_eq!(found, vec![2.0, 5.0, 10.0]);
        assert!(selection.tiles.iter().all(|t| t.session_key == "s3ss"));
        assert_eq!(
            *states.borrow(),
            SelectionState::Converged {
                passes: 3,
                discovered: 4
            }
        );
    }

    #[tokio::test]
    async fn test_selector_warns_on_widening_and_cap() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        // Nothing near a budget of 1, and every tile within 2x the finest error.
        let batch = (0..150u32)
            .map(|i| tile(&format!("t{i}"), 40.0 + f64::from(i) * 0.1))
            .collect();
        let mut traversal = ScriptedTraversal::new(vec![batch]);
        let selection = TileSelector::new()
            .select_tiles(&viewport(), sse(1.0), &mut traversal)
            .await
            .unwrap();

        assert!(matches!(selection.filter, FilterOutcome::Widened { .. }));
        assert!(selection.capped);
        assert_eq!(selection.tiles.len(), MAX_SELECTED_TILES);

        let output = logs.contents();
        assert!(output.contains("150 tiles discovered"));
        assert!(output.contains("widening to 2x the finest error"));
        assert!(output.contains("capping at 100"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector_deadline_with_nothing_discovered() {
        let mut traversal = StalledTraversal { tiles: Vec::new() };
        let selector = TileSelector::new().with_deadline(Duration::from_secs(30));

        let result = selector
            .select_tiles(&viewport(), sse(8.0), &mut traversal)
            .await;
        assert!(matches!(
            result,
            Err(Error::TraversalStalled {
                passes: 0,
                discovered: 0
            })
        ));
        assert_eq!(
            selector.state(),
            SelectionState::TimedOut {
                passes: 0,
                discovered: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector_deadline_keeps_partial_results() {
        let mut traversal = StalledTraversal {
            tiles: vec![tile("https://t/a.glb", 6.0)],
        };
        let selector = TileSelector::new().with_deadline(Duration::from_secs(30));

        let selection = selector
            .select_tiles(&viewport(), sse(8.0), &mut traversal)
            .await
            .unwrap();
        assert!(!selection.converged);
        assert_eq!(selection.tiles.len(), 1);
        assert!(selection.tiles[0].session_key.is_empty());
    }

    #[tokio::test]
    async fn test_selector_cancellation() {
        let mut traversal = StalledTraversal { tiles: Vec::new() };
        let cancel = CancellationToken::new();
        let selector = TileSelector::new().with_cancellation(cancel.clone());
        cancel.cancel();

        let result = selector
            .select_tiles(&viewport(), sse(8.0), &mut traversal)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(selector.state(), SelectionState::Cancelled);
    }

    proptest! {
        #[test]
        fn prop_ranking_sorted_unique_capped(
            raw in prop::collection::vec((0u8..40, 0.0f64..200.0), 0..300),
            target in 0.0f64..100.0,
        ) {
            let tiles: Vec<_> = raw.iter().map(|(id, e)| tile(&format!("u{id}"), *e)).collect();
            let ranking = rank_tiles(&tiles, sse(target));

            prop_assert!(ranking.tiles.len() <= MAX_SELECTED_TILES);
            prop_assert!(ranking.tiles.windows(2).all(|w| w[0].geometric_error <= w[1].geometric_error));

            let urls: HashSet<&str> = ranking.tiles.iter().map(|t| t.content_url.as_str()).collect();
            prop_assert_eq!(urls.len(), ranking.tiles.len());

            if tiles.is_empty() {
                prop_assert_eq!(ranking.filter, FilterOutcome::Empty);
            } else {
                prop_assert!(!ranking.tiles.is_empty());
            }
            if ranking.capped {
                prop_assert_eq!(ranking.tiles.len(), MAX_SELECTED_TILES);
            }
        }

        #[test]
        fn prop_many_unique_tiles_cap_exactly(count in 0usize..400) {
            let tiles: Vec<_> = (0..count).map(|i| tile(&format!("u{i}"), 3.0)).collect();
            let ranking = rank_tiles(&tiles, sse(3.0));
            prop_assert_eq!(ranking.capped, count > MAX_SELECTED_TILES);
            prop_assert_eq!(ranking.tiles.len(), count.min(MAX_SELECTED_TILES));
        }
    }
}
