//! Pinhole deprojection of depth images into local point clouds.
//!
//! For every pixel `(r, c)` the deprojector keeps a pair of ray slopes
//!
//! ```text
//! x_ray[r, c] = (c * stride_x - ppx) / fx
//! y_ray[r, c] = (r * stride_y - ppy) / fy
//! ```
//!
//! and emits the point `(d, d * x_ray, d * y_ray)` for a depth `d`.  Points
//! are ordered forward-right-down (range first) and follow the row-major
//! pixel order; pixels whose depth is `NaN` produce no point.
//!
//! The ray tables depend only on the image shape, the intrinsics and the
//! stride, so they are built once and reused until one of those changes.

use nalgebra::Point3;
use tracing::debug;
use voxmap_types::Intrinsics;

use crate::preprocess::DepthImage;

// ────────────────────────────────────────────────────────────────────────────
// RayTable
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct RayKey {
    width: usize,
    height: usize,
    intrinsics: Intrinsics,
    stride: (usize, usize),
}

/// Precomputed per-pixel ray slopes for one `(shape, intrinsics, stride)`.
#[derive(Debug, Clone)]
pub struct RayTable {
    key: RayKey,
    x_ray: Vec<f64>,
    y_ray: Vec<f64>,
}

impl RayTable {
    fn build(key: RayKey) -> Self {
        let RayKey {
            width,
            height,
            intrinsics,
            stride: (sx, sy),
        } = key;
        let n = width * height;
        let mut x_ray = Vec::with_capacity(n);
        let mut y_ray = Vec::with_capacity(n);
        for r in 0..height {
            let y = ((r * sy) as f64 - intrinsics.ppy) / intrinsics.fy;
            for c in 0..width {
                x_ray.push(((c * sx) as f64 - intrinsics.ppx) / intrinsics.fx);
                y_ray.push(y);
            }
        }
        Self { key, x_ray, y_ray }
    }

    pub fn width(&self) -> usize {
        self.key.width
    }

    pub fn height(&self) -> usize {
        self.key.height
    }

    /// `(x_ray, y_ray)` at pixel `(row, col)`.
    pub fn ray(&self, row: usize, col: usize) -> (f64, f64) {
        let i = row * self.key.width + col;
        (self.x_ray[i], self.y_ray[i])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Deprojector
// ────────────────────────────────────────────────────────────────────────────

/// Lifts depth images into local `(forward, right, down)` points.
///
/// ```rust
/// use voxmap_perception::{DepthImage, Deprojector};
/// use voxmap_types::Intrinsics;
///
/// let mut deprojector = Deprojector::new();
/// let image = DepthImage::new(2, 1, vec![1.0, f32::NAN]).unwrap();
/// let points = deprojector.deproject(&image, &Intrinsics::new(1.0, 0.0, 0.0, 1.0, 1.0));
/// assert_eq!(points.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Deprojector {
    stride: (usize, usize),
    table: Option<RayTable>,
    rebuilds: u64,
}

impl Default for Deprojector {
    fn default() -> Self {
        Self::new()
    }
}

impl Deprojector {
    pub fn new() -> Self {
        Self::with_stride(1, 1)
    }

    /// A deprojector whose pixels sit `stride_x` columns and `stride_y` rows
    /// apart in the sensor's native pixel grid.  Zero strides are raised to 1.
    pub fn with_stride(stride_x: usize, stride_y: usize) -> Self {
        Self {
            stride: (stride_x.max(1), stride_y.max(1)),
            table: None,
            rebuilds: 0,
        }
    }

    /// How many times the ray table has been (re)built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// The ray table for a `width × height` image under `intrinsics`,
    /// rebuilding it only when the key changed.
    pub fn rays(&mut self, width: usize, height: usize, intrinsics: &Intrinsics) -> &RayTable {
        let key = RayKey {
            width,
            height,
            intrinsics: *intrinsics,
            stride: self.stride,
        };
        if self.table.as_ref().is_none_or(|t| t.key != key) {
            debug!(width, height, fx = intrinsics.fx, fy = intrinsics.fy, "rebuilding ray table");
            self.rebuilds += 1;
            self.table = Some(RayTable::build(key));
        }
        self.table.get_or_insert_with(|| RayTable::build(key))
    }

    /// Deproject every non-NaN pixel of `image`.
    pub fn deproject(&mut self, image: &DepthImage, intrinsics: &Intrinsics) -> Vec<Point3<f64>> {
        let rays = self.rays(image.width(), image.height(), intrinsics);
        image
            .data()
            .iter()
            .zip(rays.x_ray.iter().zip(rays.y_ray.iter()))
            .filter(|(d, _)| !d.is_nan())
            .map(|(&d, (&xr, &yr))| {
                let d = f64::from(d);
                Point3::new(d, d * xr, d * yr)
            })
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
