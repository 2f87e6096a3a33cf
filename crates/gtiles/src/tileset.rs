//! 3D Tiles tileset documents and bounding volumes.
//!
//! Only the parts of `tileset.json` the traversal needs are modelled:
//! bounding volumes, geometric error, refinement, content and children.

use glam::{DMat3, DMat4, DVec3};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::viewport::geodetic_to_ecef;

/// A parsed `tileset.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetJson {
    pub asset: Asset,
    #[serde(default)]
    pub geometric_error: f64,
    pub root: TileJson,
}

/// The `asset` block of a tileset.
#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub version: String,
}

/// Refinement strategy of a tile. Children inherit it when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Refine {
    Add,
    Replace,
}

/// A tile as it appears in the document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileJson {
    pub bounding_volume: BoundingVolumeJson,
    pub geometric_error: f64,
    #[serde(default)]
    pub refine: Option<Refine>,
    #[serde(default)]
    pub content: Option<ContentJson>,
    #[serde(default)]
    pub children: Vec<TileJson>,
    /// Column-major 4x4 transform relative to the parent tile.
    #[serde(default)]
    pub transform: Option<[f64; 16]>,
}

/// Tile content reference. Pre-1.0 tilesets use `url` instead of `uri`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentJson {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ContentJson {
    /// The content URI reference, whichever spelling the document used.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref().or(self.url.as_deref())
    }
}

/// Raw bounding volume; exactly one of the fields is expected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoundingVolumeJson {
    #[serde(rename = "box", default)]
    pub obb: Option<[f64; 12]>,
    #[serde(default)]
    pub sphere: Option<[f64; 4]>,
    /// `[west, south, east, north, minHeight, maxHeight]`, radians and meters.
    #[serde(default)]
    pub region: Option<[f64; 6]>,
}

/// A bounding volume in earth-centered coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    /// Oriented box. Each column of `half_axes` is a scaled half-extent axis.
    Box { center: DVec3, half_axes: DMat3 },
    Sphere { center: DVec3, radius: f64 },
}

impl BoundingVolume {
    /// Build a volume from its JSON form, applying the accumulated tile transform.
    ///
    /// Regions are defined on the ellipsoid and ignore `transform`.
    pub fn from_json(json: &BoundingVolumeJson, transform: &DMat4) -> Result<Self> {
        if let Some(b) = json.obb {
            let center = transform.transform_point3(DVec3::new(b[0], b[1], b[2]));
            let half_axes = DMat3::from_mat4(*transform)
                * DMat3::from_cols(
                    DVec3::new(b[3], b[4], b[5]),
                    DVec3::new(b[6], b[7], b[8]),
                    DVec3::new(b[9], b[10], b[11]),
                );
            return Ok(BoundingVolume::Box { center, half_axes });
        }

        if let Some([x, y, z, radius]) = json.sphere {
            let linear = DMat3::from_mat4(*transform);
            let max_scale = linear
                .x_axis
                .length()
                .max(linear.y_axis.length())
                .max(linear.z_axis.length());
            return Ok(BoundingVolume::Sphere {
                center: transform.transform_point3(DVec3::new(x, y, z)),
                radius: radius * max_scale,
            });
        }

        if let Some(region) = json.region {
            return Ok(region_to_sphere(region));
        }

        Err(Error::InvalidData {
            context: "bounding volume",
            detail: "expected one of box, sphere or region".to_string(),
        })
    }

    #[must_use]
    pub fn center(&self) -> DVec3 {
        match *self {
            BoundingVolume::Box { center, .. } | BoundingVolume::Sphere { center, .. } => center,
        }
    }

    /// Center and radius of a sphere enclosing the volume.
    #[must_use]
    pub fn bounding_sphere(&self) -> (DVec3, f64) {
        match *self {
            BoundingVolume::Box { center, half_axes } => (
                center,
                (half_axes.x_axis.length_squared()
                    + half_axes.y_axis.length_squared()
                    + half_axes.z_axis.length_squared())
                .sqrt(),
            ),
            BoundingVolume::Sphere { center, radius } => (center, radius),
        }
    }

    /// Distance from `point` to the volume surface, zero when inside.
    #[must_use]
    pub fn distance_to(&self, point: DVec3) -> f64 {
        match *self {
            BoundingVolume::Box { center, half_axes } => {
                let offset = point - center;
                let mut squared = 0.0;
                for i in 0..3 {
                    let axis = half_axes.col(i);
                    let extent = axis.length();
                    if extent == 0.0 {
                        continue;
                    }
                    let d = offset.dot(axis / extent);
                    let excess = if d > extent {
                        d - extent
                    } else if d < -extent {
                        d + extent
                    } else {
                        0.0
                    };
                    squared += excess * excess;
                }
                squared.sqrt()
            }
            BoundingVolume::Sphere { center, radius } => {
                (point.distance(center) - radius).max(0.0)
            }
        }
    }
}

/// Bounding sphere of a geographic region, sampled at corners and midpoints.
fn region_to_sphere([west, south, east, north, min_height, max_height]: [f64; 6]) -> BoundingVolume {
    let mut points = Vec::with_capacity(18);
    for lat in [south, (south + north) / 2.0, north] {
        for lon in [west, (west + east) / 2.0, east] {
            for height in [min_height, max_height] {
                points.push(geodetic_to_ecef(lat.to_degrees(), lon.to_degrees(), height));
            }
        }
    }

    let min = points.iter().copied().fold(DVec3::splat(f64::MAX), DVec3::min);
    let max = points.iter().copied().fold(DVec3::splat(f64::MIN), DVec3::max);
    let center = (min + max) / 2.0;
    let radius = points
        .iter()
        .map(|p| p.distance(center))
        .fold(0.0, f64::max);

    BoundingVolume::Sphere { center, radius }
}

/// Parse a column-major transform array into a matrix.
#[must_use]
pub fn transform_matrix(transform: Option<&[f64; 16]>) -> DMat4 {
    transform.map_or(DMat4::IDENTITY, DMat4::from_cols_array)
}
