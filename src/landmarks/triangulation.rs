//! Multi-view triangulation with geometric validation.
//!
//! 1. Check the widest angular separation between the viewing rays
//! 2. Solve the N-view DLT system in normalized image coordinates
//! 3. Reject points behind any camera or with large reprojection error

use nalgebra::{DMatrix, SMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::so3::angle_between;
use crate::geometry::SE3;
use crate::map::KeyFrame;

/// Configuration for landmark triangulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Minimum angle between the two most separated viewing rays (radians).
    pub min_parallax_rad: f64,
    /// Maximum squared reprojection error in pixels² (chi-squared 95%, 2 DOF).
    pub max_reprojection_error_sq: f64,
    /// Minimum depth in every observing camera (metres).
    pub min_depth_m: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_parallax_rad: (0.9998_f64).acos(), // ~1.1 degrees
            max_reprojection_error_sq: 5.991,
            min_depth_m: 0.05,
        }
    }
}

/// One observation of a point: a keyframe and the index of its feature.
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    pub keyframe: &'a KeyFrame,
    pub feature_index: usize,
}

/// Why a triangulation was not accepted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TriangulationFailure {
    #[error("need at least two views, have {0}")]
    TooFewViews(usize),

    #[error("parallax {parallax_deg:.2}° below minimum")]
    InsufficientParallax { parallax_deg: f64 },

    #[error("linear system is singular")]
    Singular,

    #[error("point behind camera (depth {depth:.3} m)")]
    NegativeDepth { depth: f64 },

    #[error("reprojection error {error_px:.2} px too large")]
    Reprojection { error_px: f64 },
}

/// Largest angle between any two viewing rays.
pub fn max_parallax(views: &[View<'_>]) -> f64 {
    let rays: Vec<Vector3<f64>> = views
        .iter()
        .filter_map(|v| v.keyframe.bearing(v.feature_index))
        .collect();

    let mut best: f64 = 0.0;
    for i in 0..rays.len() {
        for j in (i + 1)..rays.len() {
            best = best.max(angle_between(&rays[i], &rays[j]));
        }
    }
    best
}

/// Triangulate and validate a point from two or more views.
pub fn triangulate(
    views: &[View<'_>],
    config: &TriangulationConfig,
) -> Result<Vector3<f64>, TriangulationFailure> {
    if views.len() < 2 {
        return Err(TriangulationFailure::TooFewViews(views.len()));
    }

    let parallax = max_parallax(views);
    if parallax < config.min_parallax_rad {
        return Err(TriangulationFailure::InsufficientParallax {
            parallax_deg: parallax.to_degrees(),
        });
    }

    let point = triangulate_dlt(views).ok_or(TriangulationFailure::Singular)?;
    validate(&point, views, config)?;
    Ok(point)
}

/// Homogeneous DLT over all views: the right singular vector of the smallest
/// singular value of the stacked `x * P[2] - P[0]`, `y * P[2] - P[1]` rows.
pub fn triangulate_dlt(views: &[View<'_>]) -> Option<Vector3<f64>> {
    let mut a = DMatrix::<f64>::zeros(2 * views.len(), 4);

    for (k, view) in views.iter().enumerate() {
        let feature = view.keyframe.features.get(view.feature_index)?;
        let xn = view.keyframe.intrinsics.unproject(feature.u, feature.v);
        let p = projection_matrix(&view.keyframe.pose.inverse());

        for j in 0..4 {
            a[(2 * k, j)] = xn.x * p[(2, j)] - p[(0, j)];
            a[(2 * k + 1, j)] = xn.y * p[(2, j)] - p[(1, j)];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let smallest = svd.singular_values.imin();
    let x = v_t.row(smallest);

    if x[3].abs() < 1e-10 {
        return None;
    }
    let point = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    point.iter().all(|c| c.is_finite()).then_some(point)
}

/// 3x4 projection `[R | t]` of a world-to-camera pose.
fn projection_matrix(pose_cw: &SE3) -> SMatrix<f64, 3, 4> {
    let r = pose_cw.rotation.to_rotation_matrix();
    let t = pose_cw.translation;
    SMatrix::<f64, 3, 4>::from_columns(&[
        r.matrix().column(0).into(),
        r.matrix().column(1).into(),
        r.matrix().column(2).into(),
        t,
    ])
}

/// Depth and reprojection checks in every view.
pub fn validate(
    point: &Vector3<f64>,
    views: &[View<'_>],
    config: &TriangulationConfig,
) -> Result<(), TriangulationFailure> {
    for view in views {
        let kf = view.keyframe;
        let p_cam = kf.pose.inverse().transform_point(point);
        if p_cam.z < config.min_depth_m {
            return Err(TriangulationFailure::NegativeDepth { depth: p_cam.z });
        }
        let Some(feature) = kf.features.get(view.feature_index) else {
            return Err(TriangulationFailure::Singular);
        };
        let Some(px) = kf.intrinsics.project(&p_cam) else {
            return Err(TriangulationFailure::NegativeDepth { depth: p_cam.z });
        };
        let err_sq = (px.x - feature.u).powi(2) + (px.y - feature.v).powi(2);
        if err_sq > config.max_reprojection_error_sq {
            return Err(TriangulationFailure::Reprojection {
                error_px: err_sq.sqrt(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::KeyFrameId;
    use crate::sensors::{CameraIntrinsics, Descriptor, Feature};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn observing_keyframe(id: u64, center: Vector3<f64>, point: &Vector3<f64>) -> KeyFrame {
        let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let pose = SE3::new(UnitQuaternion::identity(), center);
        let px = intrinsics
            .project(&pose.inverse().transform_point(point))
            .unwrap();
        KeyFrame {
            id: KeyFrameId::new(id),
            timestamp_ns: id,
            pose,
            intrinsics,
            features: vec![Feature::new(px.x, px.y, Descriptor::default())],
            low_confidence: false,
        }
    }

    #[test]
    fn test_two_view_triangulation_recovers_point() {
        let point = Vector3::new(0.3, -0.2, 5.0);
        let kf1 = observing_keyframe(0, Vector3::zeros(), &point);
        let kf2 = observing_keyframe(1, Vector3::new(0.5, 0.0, 0.0), &point);
        let views = [
            View { keyframe: &kf1, feature_index: 0 },
            View { keyframe: &kf2, feature_index: 0 },
        ];

        let p = triangulate(&views, &TriangulationConfig::default()).unwrap();
        assert_relative_eq!(p, point, epsilon = 1e-6);
    }

    #[test]
    fn test_multi_view_triangulation() {
        let point = Vector3::new(-1.0, 0.5, 6.0);
        let kfs: Vec<KeyFrame> = (0..4)
            .map(|i| observing_keyframe(i, Vector3::new(i as f64 * 0.4, 0.0, 0.0), &point))
            .collect();
        let views: Vec<View> = kfs
            .iter()
            .map(|kf| View { keyframe: kf, feature_index: 0 })
            .collect();

        let p = triangulate(&views, &TriangulationConfig::default()).unwrap();
        assert_relative_eq!(p, point, epsilon = 1e-6);
    }

    #[test]
    fn test_tiny_baseline_is_degenerate() {
        let point = Vector3::new(0.0, 0.0, 10.0);
        let kf1 = observing_keyframe(0, Vector3::zeros(), &point);
        let kf2 = observing_keyframe(1, Vector3::new(0.01, 0.0, 0.0), &point);
        let views = [
            View { keyframe: &kf1, feature_index: 0 },
            View { keyframe: &kf2, feature_index: 0 },
        ];

        assert!(matches!(
            triangulate(&views, &TriangulationConfig::default()),
            Err(TriangulationFailure::InsufficientParallax { .. })
        ));
    }

    #[test]
    fn test_single_view_is_rejected() {
        let point = Vector3::new(0.0, 0.0, 4.0);
        let kf = observing_keyframe(0, Vector3::zeros(), &point);
        assert_eq!(
            triangulate(&[View { keyframe: &kf, feature_index: 0 }], &TriangulationConfig::default()),
            Err(TriangulationFailure::TooFewViews(1))
        );
    }

    #[test]
    fn test_validation_rejects_point_behind_camera() {
        let point = Vector3::new(0.3, -0.2, 5.0);
        let kf1 = observing_keyframe(0, Vector3::zeros(), &point);
        let kf2 = observing_keyframe(1, Vector3::new(0.5, 0.0, 0.0), &point);
        let views = [
            View { keyframe: &kf1, feature_index: 0 },
            View { keyframe: &kf2, feature_index: 0 },
        ];

        let behind = Vector3::new(0.3, -0.2, -5.0);
        assert!(matches!(
            validate(&behind, &views, &TriangulationConfig::default()),
            Err(TriangulationFailure::NegativeDepth { .. })
        ));
    }
}
