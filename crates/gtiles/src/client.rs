//! HTTP client for the 3D Tiles API.
//!
//! This module provides the `Client` type used to download tileset documents
//! and tile content. Every request carries the API key; the key is stripped
//! from URLs before they reach logs, errors or cache keys.

use std::sync::Arc;

use reqwest::Url;

use crate::cache::{Cache, NoCache};
use crate::error::{Error, Result};
use crate::selection::TileDescriptor;
use crate::tileset::TilesetJson;

/// Root tileset of Google's photorealistic 3D Tiles.
pub const DEFAULT_TILESET_URL: &str = "https://tile.googleapis.com/v1/3dtiles/root.json";

/// HTTP client for fetching tilesets and tile content.
///
/// # Example
///
/// ```ignore
/// let client = Client::new(api_key);
/// let tileset = client.fetch_tileset(DEFAULT_TILESET_URL, "").await?;
/// ```
pub struct Client<C: Cache = NoCache> {
    http: reqwest::Client,
    api_key: String,
    cache: Arc<C>,
}

impl Client<NoCache> {
    /// Create a client without caching.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_cache(api_key, NoCache)
    }
}

impl<C: Cache> Client<C> {
    /// Create a client with a custom cache.
    #[must_use]
    pub fn with_cache(api_key: impl Into<String>, cache: C) -> Self {
        Self::with_http_and_cache(reqwest::Client::new(), api_key, cache)
    }

    /// Create a client with a custom HTTP client and cache.
    #[must_use]
    pub fn with_http_and_cache(http: reqwest::Client, api_key: impl Into<String>, cache: C) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            cache: Arc::new(cache),
        }
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Build the request URL for `url` with this client's key and `query_params`.
    pub fn authorize(&self, url: &str, query_params: &str) -> Result<Url> {
        authorized_url(url, &self.api_key, query_params)
    }

    /// Fetch and parse a tileset document.
    pub async fn fetch_tileset(&self, url: &str, query_params: &str) -> Result<TilesetJson> {
        let url = self.authorize(url, query_params)?;
        let data = self.fetch_bytes(&url).await?;
        serde_json::from_slice(&data).map_err(|e| Error::Json {
            context: "tileset",
            message: e.to_string(),
        })
    }

    /// Fetch the content of a selected tile.
    pub async fn fetch_content(&self, tile: &TileDescriptor) -> Result<Vec<u8>> {
        let url = tile.request_url(&self.api_key)?;
        self.fetch_bytes(&url).await
    }

    /// Fetch raw bytes, consulting the cache first.
    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let key = redact(url);

        if let Some(data) = self.cache.get(&key).await? {
            tracing::debug!(url = %key, "cache hit");
            return Ok(data);
        }

        tracing::debug!(url = %key, "fetching");

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Http {
                url: key.clone(),
                message: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: key,
                status: status.as_u16(),
            });
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| Error::Http {
                url: key.clone(),
                message: e.without_url().to_string(),
            })?
            .to_vec();

        self.cache.put(&key, data.clone()).await?;

        Ok(data)
    }
}

/// Parse a bare `a=1&b=2` query string into ordered pairs.
#[must_use]
pub fn parse_query(query_params: &str) -> Vec<(String, String)> {
    let query_params = query_params.trim_start_matches('?');
    if query_params.is_empty() {
        return Vec::new();
    }
    // Borrow the URL parser for decoding.
    Url::parse(&format!("http://localhost/?{query_params}"))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

/// Replace the query of `url` with `key=<api_key>` followed by `query_params`.
///
/// Any `key` pair inside `query_params` is dropped.
pub fn authorized_url(url: &str, api_key: &str, query_params: &str) -> Result<Url> {
    let mut url = Url::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    url.set_query(None);

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("key", api_key);
        for (name, value) in parse_query(query_params) {
            if name != "key" {
                pairs.append_pair(&name, &value);
            }
        }
    }

    Ok(url)
}

/// The URL as text with its `key` parameter removed.
#[must_use]
pub fn redact(url: &Url) -> String {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != "key")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut redacted = url.clone();
    redacted.set_query(None);
    if !pairs.is_empty() {
        redacted.query_pairs_mut().extend_pairs(pairs);
    }
    redacted.to_string()
}
