//! SO(3) helpers used by the epipolar gate and the anchor solvers.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rotation of `angle` radians about the +z axis.
pub fn rotation_z(angle: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle)
}

/// Angle between two bearing vectors, in radians.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let denom = a.norm() * b.norm();
    if denom < 1e-12 {
        return 0.0;
    }
    (a.dot(b) / denom).clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_matches_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 0.7, -1.0);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_angle_between() {
        let x = Vector3::x();
        let y = Vector3::y();
        assert_relative_eq!(angle_between(&x, &y), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(angle_between(&x, &(2.0 * x)), 0.0, epsilon = 1e-7);
        assert_eq!(angle_between(&x, &Vector3::zeros()), 0.0);
    }
}
