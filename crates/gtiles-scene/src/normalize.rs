//! Re-centering, orientation and scaling of earth-centered fragments.
//!
//! Tiles arrive in a shared earth-centered frame, thousands of kilometres
//! from the origin and tilted by their latitude and longitude. The
//! [`SceneNormalizer`] moves a group of fragments to the origin as one rigid
//! body: a single translation, a single rotation taking the local up
//! direction onto a target axis, and a single uniform scale. Relative layout
//! between fragments is preserved exactly.
//!
//! Normalizing already-normalized output is meaningless: the center is then
//! near the origin and the up direction is undefined. Always normalize the
//! original fragments.

use glam::{DMat4, DQuat, DVec3};

use crate::bounds::Aabb;
use crate::error::{SceneError, SceneResult};

/// Tolerance on `dot(up, target)` for treating the vectors as (anti)parallel.
const PARALLEL_EPSILON: f64 = 1e-12;

/// Geometry whose extent can be measured without decoding it.
pub trait FragmentGeometry {
    /// Bounds in the fragment's local frame.
    fn local_bounds(&self) -> Aabb;
}

impl FragmentGeometry for Aabb {
    fn local_bounds(&self) -> Aabb {
        *self
    }
}

impl<G: FragmentGeometry + ?Sized> FragmentGeometry for &G {
    fn local_bounds(&self) -> Aabb {
        (**self).local_bounds()
    }
}

/// One downloaded tile placed in the scene.
///
/// World position of a local point `p` is `position + rotation * (scale * p)`.
#[derive(Debug, Clone)]
pub struct MeshFragment<G> {
    /// Where the fragment came from, usually its content URL.
    pub source: String,
    pub geometry: G,
    pub position: DVec3,
    pub rotation: DQuat,
    pub scale: f64,
}

impl<G: FragmentGeometry> MeshFragment<G> {
    /// A fragment placed at the origin of its own geometry.
    pub fn new(source: impl Into<String>, geometry: G) -> Self {
        Self {
            source: source.into(),
            geometry,
            position: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            scale: 1.0,
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: DVec3) -> Self {
        self.position = position;
        self
    }

    /// The same placement, borrowing the geometry.
    #[must_use]
    pub fn borrowed(&self) -> MeshFragment<&G> {
        MeshFragment {
            source: self.source.clone(),
            geometry: &self.geometry,
            position: self.position,
            rotation: self.rotation,
            scale: self.scale,
        }
    }

    #[must_use]
    pub fn matrix(&self) -> DMat4 {
        DMat4::from_scale_rotation_translation(DVec3::splat(self.scale), self.rotation, self.position)
    }

    #[must_use]
    pub fn world_bounds(&self) -> Aabb {
        self.geometry.local_bounds().transformed(&self.matrix())
    }
}

/// The transform applied to every fragment: `p' = scale * rotation * (p + translation)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedTransform {
    pub translation: DVec3,
    /// Unit quaternion.
    pub rotation: DQuat,
    /// Always positive.
    pub scale: f64,
}

impl CombinedTransform {
    #[must_use]
    pub fn matrix(&self) -> DMat4 {
        DMat4::from_scale_rotation_translation(DVec3::splat(self.scale), self.rotation, DVec3::ZERO)
            * DMat4::from_translation(self.translation)
    }

    #[must_use]
    pub fn apply(&self, point: DVec3) -> DVec3 {
        self.scale * (self.rotation * (point + self.translation))
    }
}

/// Fragments after normalization, with the transform that produced them.
#[derive(Debug, Clone)]
pub struct NormalizedScene<G> {
    pub fragments: Vec<MeshFragment<G>>,
    pub transform: CombinedTransform,
    /// Center of the original combined bounds.
    pub center: DVec3,
    /// Diagonal of the original combined bounds.
    pub size: f64,
    bounds: Aabb,
    original_bounds: Aabb,
}

impl<G> NormalizedScene<G> {
    /// Combined bounds of the normalized fragments; centered on the origin.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Bounds of the fragments before normalization.
    #[must_use]
    pub fn original_bounds(&self) -> Aabb {
        self.original_bounds
    }
}

/// Normalizes fragment groups towards a fixed up axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneNormalizer {
    target_axis: DVec3,
}

impl Default for SceneNormalizer {
    /// +Y up, the glTF convention.
    fn default() -> Self {
        Self {
            target_axis: DVec3::Y,
        }
    }
}

impl SceneNormalizer {
    pub fn new(target_axis: DVec3) -> SceneResult<Self> {
        let target_axis = target_axis.try_normalize().ok_or_else(|| SceneError::InvalidData {
            context: "target axis",
            detail: format!("{target_axis} cannot be normalized"),
        })?;
        Ok(Self { target_axis })
    }

    #[must_use]
    pub fn target_axis(&self) -> DVec3 {
        self.target_axis
    }

    /// Center, orient and scale `fragments` as one group.
    pub fn normalize<G: FragmentGeometry>(
        &self,
        fragments: Vec<MeshFragment<G>>,
    ) -> SceneResult<NormalizedScene<G>> {
        if fragments.is_empty() {
            return Err(SceneError::EmptyScene);
        }

        let bounds = fragments
            .iter()
            .map(MeshFragment::world_bounds)
            .fold(Aabb::EMPTY, Aabb::union);
        if bounds.is_empty() {
            return Err(SceneError::InvalidData {
                context: "scene bounds",
                detail: "no fragment has any geometry".to_string(),
            });
        }
        let center = bounds.center();
        let size = bounds.size();

        let rotation = match center.try_normalize() {
            Some(up) => rotation_between(up, self.target_axis),
            None => DQuat::IDENTITY,
        };
        let scale = if size > 0.0 && size.is_finite() {
            1.0 / size
        } else {
            1.0
        };

        tracing::debug!(
            fragments = fragments.len(),
            ?center,
            size,
            scale,
            "normalizing scene"
        );

        // Rotating an axis-aligned box moves the center of its axis-aligned
        // hull, so recenter on the rotated layout before scaling.
        let rotated: Vec<_> = fragments
            .into_iter()
            .map(|fragment| MeshFragment {
                position: rotation * (fragment.position - center),
                rotation: (rotation * fragment.rotation).normalize(),
                ..fragment
            })
            .collect();
        let shift = rotated
            .iter()
            .map(MeshFragment::world_bounds)
            .fold(Aabb::EMPTY, Aabb::union)
            .center();

        let fragments: Vec<_> = rotated
            .into_iter()
            .map(|fragment| MeshFragment {
                position: scale * (fragment.position - shift),
                scale: scale * fragment.scale,
                ..fragment
            })
            .collect();
        let normalized_bounds = fragments
            .iter()
            .map(MeshFragment::world_bounds)
            .fold(Aabb::EMPTY, Aabb::union);

        Ok(NormalizedScene {
            fragments,
            transform: CombinedTransform {
                translation: -center - rotation.inverse() * shift,
                rotation,
                scale,
            },
            center,
            size,
            bounds: normalized_bounds,
            original_bounds: bounds,
        })
    }
}

/// Shortest rotation taking unit vector `from` onto unit vector `to`.
///
/// Parallel input gives the identity; anti-parallel input gives a half turn
/// about an axis orthogonal to `to`.
#[must_use]
pub fn rotation_between(from: DVec3, to: DVec3) -> DQuat {
    let dot = from.dot(to).clamp(-1.0, 1.0);
    if dot >= 1.0 - PARALLEL_EPSILON {
        return DQuat::IDENTITY;
    }
    if dot <= -1.0 + PARALLEL_EPSILON {
        return DQuat::from_axis_angle(to.any_orthonormal_vector(), std::f64::consts::PI);
    }
    let axis = from.cross(to).normalize();
    DQuat::from_axis_angle(axis, dot.acos())
}
