//! SE3: rigid body transform used for keyframe poses.
//!
//! Keyframe poses are stored camera-to-world (`T_wc`): `transform_point` maps a
//! point from the camera frame into the local map frame and `translation` is
//! the camera centre.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// 6-DOF rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from quaternion components (w, x, y, z) and a translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz)),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Relative transform `self^{-1} * other`.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    /// Euclidean distance between the two translations.
    pub fn translation_distance(&self, other: &SE3) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Geodesic angle (radians) between the two rotations.
    pub fn rotation_angle(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }

    /// Tangent-space parameters `[rotation_vector (3), translation (3)]`.
    pub fn log(&self) -> [f64; 6] {
        let r = self.rotation.scaled_axis();
        [
            r.x,
            r.y,
            r.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Inverse of [`SE3::log`].
    pub fn exp(tangent: &[f64; 6]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
        }
    }

    /// All components are finite and the quaternion has unit norm.
    pub fn is_finite(&self) -> bool {
        let q = self.rotation.quaternion();
        q.coords.iter().all(|c| c.is_finite())
            && (q.norm() - 1.0).abs() < 1e-6
            && self.translation.iter().all(|c| c.is_finite())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    fn yaw(angle: f64) -> UnitQuaternion<f64> {
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::y()), angle)
    }

    #[test]
    fn test_inverse_compose_is_identity() {
        let pose = SE3::new(yaw(0.7), Vector3::new(1.0, -2.0, 0.5));
        let round = pose.compose(&pose.inverse());

        assert_relative_eq!(round.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(round.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_between_recovers_relative_motion() {
        let a = SE3::new(yaw(0.2), Vector3::new(0.0, 0.0, 1.0));
        let delta = SE3::new(yaw(-0.1), Vector3::new(0.5, 0.0, 0.0));
        let b = a.compose(&delta);

        let recovered = a.between(&b);
        assert_relative_eq!(recovered.translation, delta.translation, epsilon = 1e-12);
        assert_relative_eq!(recovered.rotation.angle_to(&delta.rotation), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_angle_and_distance() {
        let a = SE3::identity();
        let b = SE3::new(yaw(0.3), Vector3::new(3.0, 4.0, 0.0));

        assert_relative_eq!(a.translation_distance(&b), 5.0, epsilon = 1e-12);
        assert_relative_eq!(a.rotation_angle(&b), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp() {
        let pose = SE3::new(yaw(1.1), Vector3::new(0.1, 0.2, 0.3));
        let back = SE3::exp(&pose.log());

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(back.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_non_finite_pose_detected() {
        let mut pose = SE3::identity();
        assert!(pose.is_finite());
        pose.translation.x = f64::NAN;
        assert!(!pose.is_finite());
    }
}
