//! Local-to-global frame transform.
//!
//! A [`Pose`] places the sensor in the global frame.  [`RigidTransform`]
//! turns it into a rotation (unit quaternion) followed by a translation and
//! applies that to a local point cloud:
//!
//! ```text
//! p_global = q · p_local · q* + t
//! ```
//!
//! Pose quaternions are scalar-last, `[x, y, z, w]`.
//!
//! # Example
//!
//! ```rust
//! use nalgebra::Point3;
//! use voxmap_perception::transform::to_global;
//! use voxmap_types::Pose;
//!
//! let mut pose = Pose::identity(0.0);
//! pose.translation = [1.0, 0.0, 0.0];
//!
//! let out = to_global(&[Point3::new(0.5, 0.0, 0.0)], &pose).unwrap();
//! assert!((out[0].x - 1.5).abs() < 1e-12);
//! ```

use nalgebra::{Point3, Quaternion, Translation3, UnitQuaternion};
use voxmap_types::{MapError, Pose};

/// How far `|q|` may stray from 1 before the pose is rejected.
pub const QUATERNION_NORM_TOLERANCE: f64 = 1e-3;

// ────────────────────────────────────────────────────────────────────────────
// RigidTransform
// ────────────────────────────────────────────────────────────────────────────

/// Rotation followed by translation, built from a pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Translation3<f64>,
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Translation3::identity(),
        }
    }

    /// Build the transform for `pose`.
    ///
    /// A finite quaternion whose norm lies within
    /// [`QUATERNION_NORM_TOLERANCE`] of 1 is renormalised; one further off is
    /// rejected.  Non-finite components are carried through unchanged so the
    /// resulting NaN/Inf coordinates reach the voxelizer, which rejects the
    /// whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NonUnitQuaternion`] for a finite, non-unit
    /// quaternion.
    pub fn from_pose(pose: &Pose) -> Result<Self, MapError> {
        let [x, y, z, w] = pose.quaternion;
        let q = Quaternion::new(w, x, y, z);
        let norm = q.norm();
        let rotation = if norm.is_finite() {
            if (norm - 1.0).abs() > QUATERNION_NORM_TOLERANCE {
                return Err(MapError::NonUnitQuaternion { norm });
            }
            UnitQuaternion::from_quaternion(q)
        } else {
            UnitQuaternion::new_unchecked(q)
        };
        let [tx, ty, tz] = pose.translation;
        Ok(Self {
            rotation,
            translation: Translation3::new(tx, ty, tz),
        })
    }

    pub fn apply(&self, p: &Point3<f64>) -> Point3<f64> {
        self.translation * (self.rotation * p)
    }

    pub fn apply_all(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points.iter().map(|p| self.apply(p)).collect()
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Move local `points` into the global frame described by `pose`.
pub fn to_global(points: &[Point3<f64>], pose: &Pose) -> Result<Vec<Point3<f64>>, MapError> {
    Ok(RigidTransform::from_pose(pose)?.apply_all(points))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_1_SQRT_2;

    fn pose_with(quaternion: [f64; 4], translation: [f64; 3]) -> Pose {
        Pose {
            timestamp: 0.0,
            translation,
            quaternion,
            confidence: 3,
        }
    }

    // ── Rotation ────────────────────────────────────────────────────────────

    #[test]
    fn identity_pose_is_noop() {
        let p = Point3::new(1.0, 2.0, 3.0);
        let out = to_global(&[p], &Pose::identity(0.0)).unwrap();
        assert!((out[0] - p).norm() < 1e-12);
    }

    #[test]
    fn yaw_90deg_rotates_x_to_y() {
        // [x, y, z, w] for 90° about +Z.
        let pose = pose_with([0.0, 0.0, FRAC_1_SQRT_2, FRAC_1_SQRT_2], [0.0; 3]);
        let out = to_global(&[Point3::new(1.0, 0.0, 0.0)], &pose).unwrap();
        assert!(out[0].x.abs() < 1e-9, "x should be ~0, got {}", out[0].x);
        assert!((out[0].y - 1.0).abs() < 1e-9, "y should be ~1, got {}", out[0].y);
        assert!(out[0].z.abs() < 1e-9);
    }

    #[test]
    fn rotation_happens_before_translation() {
        let pose = pose_with([0.0, 0.0, FRAC_1_SQRT_2, FRAC_1_SQRT_2], [10.0, 0.0, 0.0]);
        let out = to_global(&[Point3::new(1.0, 0.0, 0.0)], &pose).unwrap();
        assert!((out[0].x - 10.0).abs() < 1e-9);
        assert!((out[0].y - 1.0).abs() < 1e-9);
    }

    // ── Quaternion validation ───────────────────────────────────────────────

    #[test]
    fn slightly_off_unit_quaternion_is_renormalised() {
        let pose = pose_with([0.0, 0.0, 0.0, 1.0005], [0.0; 3]);
        let t = RigidTransform::from_pose(&pose).unwrap();
        assert!((t.rotation.quaternion().norm() - 1.0).abs() < 1e-12);
        let out = t.apply(&Point3::new(2.0, 0.0, 0.0));
        assert!((out.x - 2.0).abs() < 1e-9);
    }

    #[test]
    fn non_unit_quaternion_is_rejected() {
        let pose = pose_with([0.0, 0.0, 0.0, 2.0], [0.0; 3]);
        match to_global(&[Point3::origin()], &pose) {
            Err(MapError::NonUnitQuaternion { norm }) => assert!((norm - 2.0).abs() < 1e-12),
            other => panic!("expected NonUnitQuaternion, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_pose_propagates_into_points() {
        let pose = pose_with([0.0, 0.0, 0.0, f64::NAN], [0.0; 3]);
        let out = to_global(&[Point3::new(1.0, 0.0, 0.0)], &pose).unwrap();
        assert!(out[0].x.is_nan());

        let pose = pose_with([0.0, 0.0, 0.0, 1.0], [f64::INFINITY, 0.0, 0.0]);
        let out = to_global(&[Point3::new(1.0, 0.0, 0.0)], &pose).unwrap();
        assert!(out[0].x.is_infinite());
    }

    #[test]
    fn empty_cloud_stays_empty() {
        assert!(to_global(&[], &Pose::identity(0.0)).unwrap().is_empty());
    }
}
