//! Error types for the gtiles crate.

use std::fmt;

/// Result type for gtiles operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while traversing, selecting or downloading tiles.
#[derive(Debug)]
pub enum Error {
    /// HTTP request failed before a response arrived.
    Http {
        /// The URL that failed (without the API key).
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error (without the API key).
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// A tileset document could not be parsed.
    Json {
        /// Context for where the error occurred.
        context: &'static str,
        /// The error message.
        message: String,
    },
    /// A URL could not be parsed or resolved.
    InvalidUrl {
        /// The offending URL or URI reference.
        url: String,
        /// The error message.
        message: String,
    },
    /// Invalid data in a tileset.
    InvalidData {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// Viewport parameters were out of range.
    InvalidViewport(String),
    /// The traversal never converged and nothing was discovered before the deadline.
    TraversalStalled {
        /// Number of traversal passes performed.
        passes: u32,
        /// Number of tiles discovered when the deadline hit.
        discovered: usize,
    },
    /// The operation was cancelled.
    Cancelled,
}

impl Error {
    /// Whether retrying the same request could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http { .. } => true,
            Error::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Json { context, message } => {
                write!(f, "failed to parse {context}: {message}")
            }
            Error::InvalidUrl { url, message } => {
                write!(f, "invalid url {url}: {message}")
            }
            Error::InvalidData { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
            Error::InvalidViewport(detail) => write!(f, "invalid viewport: {detail}"),
            Error::TraversalStalled { passes, discovered } => write!(
                f,
                "tileset traversal did not converge after {passes} passes ({discovered} tiles discovered)"
            ),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json {
            context: "json",
            message: e.to_string(),
        }
    }
}
