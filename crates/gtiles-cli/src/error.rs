//! Errors surfaced by the command-line tool.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Missing or invalid configuration; nothing was fetched.
    Config(String),
    /// Reading or writing a file failed.
    Io { path: PathBuf, source: io::Error },
    /// The settings file could not be parsed or written.
    Settings(String),
    Tiles(gtiles::Error),
    Scene(gtiles_scene::SceneError),
}

impl CliError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CliError::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(message) => write!(f, "configuration error: {message}"),
            CliError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            CliError::Settings(message) => write!(f, "settings: {message}"),
            CliError::Tiles(e) => write!(f, "{e}"),
            CliError::Scene(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io { source, .. } => Some(source),
            CliError::Tiles(e) => Some(e),
            CliError::Scene(e) => Some(e),
            CliError::Config(_) | CliError::Settings(_) => None,
        }
    }
}

impl From<gtiles::Error> for CliError {
    fn from(e: gtiles::Error) -> Self {
        CliError::Tiles(e)
    }
}

impl From<gtiles_scene::SceneError> for CliError {
    fn from(e: gtiles_scene::SceneError) -> Self {
        CliError::Scene(e)
    }
}
