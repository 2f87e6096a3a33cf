//! Error types for scene processing.

use std::fmt;

/// Result type for scene operations.
pub type SceneResult<T> = std::result::Result<T, SceneError>;

/// Errors that can occur while reading, normalizing or merging tile scenes.
#[derive(Debug)]
pub enum SceneError {
    /// The binary glTF container could not be read or written.
    Glb(String),
    /// The glTF JSON chunk could not be parsed or serialized.
    Json(String),
    /// The glTF document is structurally invalid.
    InvalidData {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// The document uses a feature that cannot be processed.
    Unsupported(String),
    /// There was nothing to normalize or merge.
    EmptyScene,
}

impl fmt::Display for SceneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneError::Glb(message) => write!(f, "invalid glb container: {message}"),
            SceneError::Json(message) => write!(f, "invalid gltf json: {message}"),
            SceneError::InvalidData { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
            SceneError::Unsupported(what) => write!(f, "unsupported gltf feature: {what}"),
            SceneError::EmptyScene => write!(f, "scene has no fragments"),
        }
    }
}

impl std::error::Error for SceneError {}

impl From<serde_json::Error> for SceneError {
    fn from(e: serde_json::Error) -> Self {
        SceneError::Json(e.to_string())
    }
}

impl From<gltf::Error> for SceneError {
    fn from(e: gltf::Error) -> Self {
        SceneError::Glb(e.to_string())
    }
}
