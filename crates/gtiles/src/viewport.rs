//! Viewports, cameras and the screen-space error metric.
//!
//! A [`ViewportSpec`] follows Web-Mercator map conventions: 512-pixel world
//! tiles, a nadir camera with north up, and a camera altitude of 1.5 screen
//! heights. From it we derive a perspective camera in earth-centered
//! coordinates that the traversal uses for culling and LOD decisions.

use std::f64::consts::PI;

use glam::{DMat4, DVec3};

use crate::error::{Error, Result};
use crate::tileset::BoundingVolume;

/// WGS84 semi-major axis in meters.
pub const WGS84_RADIUS: f64 = 6_378_137.0;
/// WGS84 flattening.
pub const WGS84_FLATTENING: f64 = 1.0 / 298.257_223_563;
/// Latitude limit of the Web-Mercator projection.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

/// World size in pixels at zoom 0.
const TILE_SIZE: f64 = 512.0;
/// Camera altitude in screen heights.
const ALTITUDE: f64 = 1.5;
const NEAR: f64 = 1.0;
const FAR: f64 = 100_000_000.0;
/// Radius of the sphere used for horizon culling; the WGS84 polar radius, so
/// the occluder never extends past the ellipsoid.
const OCCLUDER_RADIUS: f64 = WGS84_RADIUS * (1.0 - WGS84_FLATTENING);
/// Lower bound on camera distance for the SSE computation.
const MIN_DISTANCE: f64 = 1e-3;

/// Convert geodetic latitude, longitude (degrees) and ellipsoidal height to ECEF.
#[must_use]
pub fn geodetic_to_ecef(lat_deg: f64, lon_deg: f64, height: f64) -> DVec3 {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let e2 = WGS84_FLATTENING * (2.0 - WGS84_FLATTENING);
    let n = WGS84_RADIUS / (1.0 - e2 * lat.sin() * lat.sin()).sqrt();
    DVec3::new(
        (n + height) * lat.cos() * lon.cos(),
        (n + height) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + height) * lat.sin(),
    )
}

/// Ellipsoid surface normal (local "up") at a geodetic position.
#[must_use]
pub fn surface_normal(lat_deg: f64, lon_deg: f64) -> DVec3 {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    DVec3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
}

/// The geographic viewport tiles are selected for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSpec {
    width: u32,
    height: u32,
    latitude: f64,
    longitude: f64,
    zoom: f64,
}

impl ViewportSpec {
    /// Create a validated viewport.
    pub fn new(width: u32, height: u32, latitude: f64, longitude: f64, zoom: f64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidViewport(format!(
                "dimensions must be positive, got {width}x{height}"
            )));
        }
        if !latitude.is_finite() || latitude.abs() > MAX_MERCATOR_LATITUDE {
            return Err(Error::InvalidViewport(format!(
                "latitude {latitude} outside ±{MAX_MERCATOR_LATITUDE}"
            )));
        }
        if !longitude.is_finite() || longitude.abs() > 180.0 {
            return Err(Error::InvalidViewport(format!(
                "longitude {longitude} outside ±180"
            )));
        }
        if !zoom.is_finite() || zoom < 0.0 {
            return Err(Error::InvalidViewport(format!(
                "zoom must be non-negative, got {zoom}"
            )));
        }
        Ok(Self {
            width,
            height,
            latitude,
            longitude,
            zoom,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    #[must_use]
    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// Ground resolution at the viewport center.
    #[must_use]
    pub fn meters_per_pixel(&self) -> f64 {
        2.0 * PI * WGS84_RADIUS * self.latitude.to_radians().cos()
            / (TILE_SIZE * self.zoom.exp2())
    }

    /// Derive the perspective camera looking straight down at the viewport center.
    #[must_use]
    pub fn camera(&self) -> ViewCamera {
        let lat = self.latitude.to_radians();
        let lon = self.longitude.to_radians();

        let target = geodetic_to_ecef(self.latitude, self.longitude, 0.0);
        let normal = surface_normal(self.latitude, self.longitude);
        let distance = ALTITUDE * f64::from(self.height) * self.meters_per_pixel();
        let north = DVec3::new(-lat.sin() * lon.cos(), -lat.sin() * lon.sin(), lat.cos());

        ViewCamera {
            position: target + normal * distance,
            target,
            up: north,
            fov_y: 2.0 * (0.5 / ALTITUDE).atan(),
            aspect: f64::from(self.width) / f64::from(self.height),
            screen_height: f64::from(self.height),
        }
    }
}

/// A perspective camera in earth-centered coordinates.
#[derive(Debug, Clone, Copy)]
pub struct ViewCamera {
    pub position: DVec3,
    pub target: DVec3,
    /// Screen-up direction.
    pub up: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    pub aspect: f64,
    pub screen_height: f64,
}

impl ViewCamera {
    #[must_use]
    pub fn view_projection(&self) -> DMat4 {
        let view = DMat4::look_at_rh(self.position, self.target, self.up);
        let projection = DMat4::perspective_rh_gl(self.fov_y, self.aspect, NEAR, FAR);
        projection * view
    }

    /// View frustum with horizon culling against the earth.
    #[must_use]
    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(self.view_projection()).with_horizon(self.position, OCCLUDER_RADIUS)
    }

    #[must_use]
    pub fn lod_metrics(&self) -> LodMetrics {
        LodMetrics::new(self.position, self.fov_y, self.screen_height)
    }
}

/// A frustum for culling tiles by their bounding volumes.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    /// Left, right, bottom, top, near, far planes as (normal, distance).
    planes: [(DVec3, f64); 6],
    horizon: Option<Horizon>,
}

/// Occlusion by an earth-centered sphere as seen from a viewpoint.
#[derive(Debug, Clone, Copy)]
struct Horizon {
    viewer: DVec3,
    /// Unit vector from the earth center to the viewer.
    direction: DVec3,
    /// Distance of the horizon plane from the earth center along `direction`.
    plane_distance: f64,
    /// Half-angle of the cone of space hidden behind the sphere.
    shadow_angle: f64,
}

impl Horizon {
    /// `None` when the viewer is inside the occluder and nothing can be culled.
    fn new(viewer: DVec3, radius: f64) -> Option<Self> {
        let distance = viewer.length();
        if distance <= radius {
            return None;
        }
        Some(Self {
            viewer,
            direction: viewer / distance,
            plane_distance: radius * radius / distance,
            shadow_angle: (radius / distance).asin(),
        })
    }

    /// Whether a sphere lies entirely behind the horizon.
    fn occludes(&self, center: DVec3, radius: f64) -> bool {
        if center.dot(self.direction) + radius >= self.plane_distance {
            return false;
        }
        let offset = center - self.viewer;
        let distance = offset.length();
        if distance <= radius {
            return false;
        }
        let angle = offset.angle_between(-self.direction);
        angle + (radius / distance).asin() <= self.shadow_angle
    }
}

impl Frustum {
    /// Extract the six planes of a view-projection matrix.
    #[must_use]
    pub fn from_matrix(vp: DMat4) -> Self {
        let m = vp.to_cols_array_2d();
        let row = |r: usize| [m[0][r], m[1][r], m[2][r], m[3][r]];
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

        let plane = |sign: f64, r: [f64; 4]| {
            Self::normalize_plane(
                r3[0] + sign * r[0],
                r3[1] + sign * r[1],
                r3[2] + sign * r[2],
                r3[3] + sign * r[3],
            )
        };

        Self {
            planes: [
                plane(1.0, r0),
                plane(-1.0, r0),
                plane(1.0, r1),
                plane(-1.0, r1),
                plane(1.0, r2),
                plane(-1.0, r2),
            ],
            horizon: None,
        }
    }

    /// Also cull volumes hidden behind a sphere of `radius` around the origin
    /// when seen from `viewer`.
    #[must_use]
    pub fn with_horizon(mut self, viewer: DVec3, radius: f64) -> Self {
        self.horizon = Horizon::new(viewer, radius);
        self
    }

    fn normalize_plane(a: f64, b: f64, c: f64, d: f64) -> (DVec3, f64) {
        let normal = DVec3::new(a, b, c);
        let length = normal.length();
        if length > 0.0 {
            (normal / length, d / length)
        } else {
            (DVec3::ZERO, 0.0)
        }
    }

    /// Whether any part of `volume` may be inside the frustum.
    #[must_use]
    pub fn intersects(&self, volume: &BoundingVolume) -> bool {
        for &(normal, distance) in &self.planes {
            let (center, r) = match *volume {
                BoundingVolume::Box { center, half_axes } => (
                    center,
                    half_axes.x_axis.dot(normal).abs()
                        + half_axes.y_axis.dot(normal).abs()
                        + half_axes.z_axis.dot(normal).abs(),
                ),
                BoundingVolume::Sphere { center, radius } => (center, radius),
            };

            // Entirely behind one plane means outside.
            if normal.dot(center) + distance < -r {
                return false;
            }
        }

        if let Some(horizon) = &self.horizon {
            let (center, radius) = volume.bounding_sphere();
            if horizon.occludes(center, radius) {
                return false;
            }
        }
        true
    }
}

/// Screen-space error metric for refinement decisions.
#[derive(Debug, Clone, Copy)]
pub struct LodMetrics {
    pub camera_position: DVec3,
    /// `2 * tan(fov_y / 2)`.
    pub sse_denominator: f64,
    pub screen_height: f64,
}

impl LodMetrics {
    #[must_use]
    pub fn new(camera_position: DVec3, fov_y: f64, screen_height: f64) -> Self {
        Self {
            camera_position,
            sse_denominator: 2.0 * (fov_y / 2.0).tan(),
            screen_height,
        }
    }

    /// Projected size in pixels of `geometric_error` meters seen from `distance`.
    #[must_use]
    pub fn screen_space_error(&self, geometric_error: f64, distance: f64) -> f64 {
        let distance = distance.max(MIN_DISTANCE);
        geometric_error * self.screen_height / (distance * self.sse_denominator)
    }

    /// Screen-space error of a tile given its bounding volume.
    #[must_use]
    pub fn tile_error(&self, geometric_error: f64, volume: &BoundingVolume) -> f64 {
        self.screen_space_error(geometric_error, volume.distance_to(self.camera_position))
    }
}
