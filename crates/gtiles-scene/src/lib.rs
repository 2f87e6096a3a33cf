//! Normalize and merge earth-centered glTF tile fragments.
//!
//! Downloaded 3D Tiles content sits in a shared earth-centered frame. This
//! crate measures each tile without decoding its geometry, moves the group
//! to the origin with one rigid transform, and merges it into a single glTF
//! document for export.
//!
//! # Example
//!
//! ```ignore
//! use gtiles_scene::{ExportFormat, GlbDocument, MeshFragment, SceneNormalizer};
//!
//! let fragments = tiles
//!     .iter()
//!     .map(|(url, bytes)| Ok(MeshFragment::new(url.clone(), GlbDocument::from_slice(bytes)?)))
//!     .collect::<gtiles_scene::SceneResult<Vec<_>>>()?;
//!
//! let scene = SceneNormalizer::default().normalize(fragments)?;
//! let merged = gtiles_scene::merge_scene(&scene)?;
//! let output = gtiles_scene::export(&merged, ExportFormat::Binary, "scene")?;
//! ```

pub mod bounds;
mod error;
mod export;
pub mod glb;
mod merge;
pub mod normalize;

pub use bounds::Aabb;
pub use error::{SceneError, SceneResult};
pub use export::{ExportFormat, Exported, export};
pub use glb::GlbDocument;
pub use merge::merge_scene;
pub use normalize::{
    CombinedTransform, FragmentGeometry, MeshFragment, NormalizedScene, SceneNormalizer,
    rotation_between,
};
