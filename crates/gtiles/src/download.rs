//! Sequential download of selected tiles.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::selection::TileDescriptor;

/// How transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per tile, at least one.
    pub attempts: u32,
    /// Delay before the second attempt; later attempts wait proportionally longer.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    #[must_use]
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// A tile whose content was fetched.
#[derive(Debug, Clone)]
pub struct DownloadedTile {
    /// Position of the tile in the requested list.
    pub index: usize,
    pub descriptor: TileDescriptor,
    pub data: Vec<u8>,
}

/// A tile that could not be fetched.
#[derive(Debug)]
pub struct FailedTile {
    pub index: usize,
    pub content_url: String,
    pub error: Error,
}

/// Outcome of [`Client::download_tiles`]. Both lists keep request order.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<DownloadedTile>,
    pub failed: Vec<FailedTile>,
    /// Set when the run stopped early because of cancellation.
    pub cancelled: bool,
}

impl<C: Cache> Client<C> {
    /// Fetch the content of every tile in order.
    ///
    /// A tile that fails after all attempts is logged and skipped; the rest
    /// are still fetched.
    pub async fn download_tiles(
        &self,
        tiles: &[TileDescriptor],
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> DownloadReport {
        self.download_tiles_with_progress(tiles, retry, cancel, |_, _| {})
            .await
    }

    /// Like [`Client::download_tiles`], calling `progress(done, total)` after each tile.
    pub async fn download_tiles_with_progress(
        &self,
        tiles: &[TileDescriptor],
        retry: &RetryPolicy,
        cancel: &CancellationToken,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> DownloadReport {
        let mut report = DownloadReport::default();
        let total = tiles.len();

        for (index, descriptor) in tiles.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            tracing::info!(
                "downloading tile {}/{total} ({})",
                index + 1,
                descriptor.content_url
            );

            match self.fetch_with_retry(descriptor, retry, cancel).await {
                Ok(data) => report.downloaded.push(DownloadedTile {
                    index,
                    descriptor: descriptor.clone(),
                    data,
                }),
                Err(Error::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        url = %descriptor.content_url,
                        %error,
                        "failed to download tile, skipping"
                    );
                    report.failed.push(FailedTile {
                        index,
                        content_url: descriptor.content_url.clone(),
                        error,
                    });
                }
            }
            progress(index + 1, total);
        }

        tracing::info!(
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "download finished"
        );
        report
    }

    async fn fetch_with_retry(
        &self,
        descriptor: &TileDescriptor,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.fetch_content(descriptor) => result,
            };

            match result {
                Err(error) if attempt < attempts && error.is_retryable() => {
                    let delay = retry.backoff * attempt;
                    tracing::debug!(attempt, ?delay, %error, "retrying tile");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
