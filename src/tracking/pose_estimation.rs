//! Keyframe pose from its matches to confirmed landmarks.
//!
//! Motion-only refinement: the tracked pose seeds a Gauss-Newton solve of the
//! reprojection error under a Huber kernel, followed by rounds of chi-squared
//! outlier rejection. The result is where the landmark geometry puts the
//! camera, independent of the pose the frame arrived with, and feeds the
//! covisibility constraints of the pose graph.

use nalgebra::{Matrix2x6, Matrix6, UnitQuaternion, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::error::ObservationError;
use crate::geometry::SE3;
use crate::sensors::CameraIntrinsics;

const MIN_DEPTH: f64 = 1e-3;
const STEP_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseEstimationConfig {
    /// Inlier correspondences needed for an estimate.
    pub min_inliers: usize,
    /// Outlier rejection rounds.
    pub rounds: usize,
    /// Gauss-Newton iterations per round.
    pub iterations_per_round: usize,
    /// Huber kernel threshold (pixels).
    pub huber_threshold_px: f64,
    /// Squared reprojection error above which a match is an outlier (pixels²).
    pub max_error_sq: f64,
}

impl Default for PoseEstimationConfig {
    fn default() -> Self {
        Self {
            min_inliers: 12,
            rounds: 4,
            iterations_per_round: 10,
            huber_threshold_px: 5.991_f64.sqrt(),
            max_error_sq: 5.991,
        }
    }
}

/// A map point and the pixel it was matched to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseCorrespondence {
    pub point: Vector3<f64>,
    pub pixel: Vector2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    /// Camera-to-map pose (`T_wc`).
    pub pose: SE3,
    pub inliers: usize,
    pub rms_error_px: f64,
}

/// Estimate `T_wc` from 3D-2D matches, starting at `initial`.
pub fn estimate_pose(
    initial: &SE3,
    intrinsics: &CameraIntrinsics,
    correspondences: &[PoseCorrespondence],
    config: &PoseEstimationConfig,
) -> Result<PoseEstimate, ObservationError> {
    let required = config.min_inliers.max(3);
    if correspondences.len() < required {
        return Err(ObservationError::DegenerateGeometry(format!(
            "{} landmark matches, {required} required",
            correspondences.len()
        )));
    }

    let mut pose_cw = initial.inverse();
    let mut inliers = vec![true; correspondences.len()];
    let mut count = correspondences.len();

    for _ in 0..config.rounds.max(1) {
        pose_cw = refine(pose_cw, intrinsics, correspondences, &inliers, config);

        count = 0;
        for (c, inlier) in correspondences.iter().zip(inliers.iter_mut()) {
            *inlier = reprojection_error(&pose_cw, intrinsics, c)
                .is_some_and(|e| e.norm_squared() <= config.max_error_sq);
            count += usize::from(*inlier);
        }
        if count < required {
            return Err(ObservationError::DegenerateGeometry(format!(
                "{count} of {} landmark matches consistent, {required} required",
                correspondences.len()
            )));
        }
    }

    let sum_sq: f64 = correspondences
        .iter()
        .zip(&inliers)
        .filter(|(_, ok)| **ok)
        .filter_map(|(c, _)| reprojection_error(&pose_cw, intrinsics, c))
        .map(|e| e.norm_squared())
        .sum();
    let pose = pose_cw.inverse();
    if !pose.is_finite() {
        return Err(ObservationError::DegenerateGeometry("pose estimate diverged".into()));
    }

    Ok(PoseEstimate {
        pose,
        inliers: count,
        rms_error_px: (sum_sq / count as f64).sqrt(),
    })
}

/// Gauss-Newton on `T_cw` with the left update `T_cw <- [exp(w) | v] * T_cw`.
/// A step that raises the robust cost ends the round.
fn refine(
    mut pose_cw: SE3,
    intrinsics: &CameraIntrinsics,
    correspondences: &[PoseCorrespondence],
    inliers: &[bool],
    config: &PoseEstimationConfig,
) -> SE3 {
    let mut cost = robust_cost(&pose_cw, intrinsics, correspondences, inliers, config);

    for _ in 0..config.iterations_per_round {
        let mut hessian = Matrix6::zeros();
        let mut gradient = Vector6::zeros();
        for (c, _) in correspondences.iter().zip(inliers).filter(|(_, ok)| **ok) {
            let p_cam = pose_cw.transform_point(&c.point);
            let Some(error) = reprojection_error(&pose_cw, intrinsics, c) else {
                continue;
            };
            let w = huber_weight(error.norm(), config.huber_threshold_px);
            let j = jacobian(intrinsics, &p_cam);
            hessian += w * j.transpose() * j;
            gradient += w * j.transpose() * error;
        }

        let Some(delta) = hessian.cholesky().map(|chol| chol.solve(&-gradient)) else {
            break;
        };
        let trial = apply_update(&pose_cw, &delta);
        let trial_cost = robust_cost(&trial, intrinsics, correspondences, inliers, config);
        if trial_cost.is_nan() || trial_cost >= cost {
            break;
        }
        pose_cw = trial;
        cost = trial_cost;
        if delta.norm() < STEP_TOLERANCE {
            break;
        }
    }
    pose_cw
}

fn apply_update(pose_cw: &SE3, delta: &Vector6<f64>) -> SE3 {
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
    SE3::new(rotation, Vector3::new(delta[3], delta[4], delta[5])).compose(pose_cw)
}

/// Observed minus projected pixel; `None` behind the camera.
fn reprojection_error(
    pose_cw: &SE3,
    intrinsics: &CameraIntrinsics,
    c: &PoseCorrespondence,
) -> Option<Vector2<f64>> {
    let p_cam = pose_cw.transform_point(&c.point);
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    intrinsics.project(&p_cam).map(|px| c.pixel - px)
}

fn robust_cost(
    pose_cw: &SE3,
    intrinsics: &CameraIntrinsics,
    correspondences: &[PoseCorrespondence],
    inliers: &[bool],
    config: &PoseEstimationConfig,
) -> f64 {
    let k = config.huber_threshold_px;
    correspondences
        .iter()
        .zip(inliers)
        .filter(|(_, ok)| **ok)
        .map(|(c, _)| match reprojection_error(pose_cw, intrinsics, c) {
            Some(e) => {
                let r = e.norm();
                if r <= k {
                    r * r
                } else {
                    2.0 * k * r - k * k
                }
            }
            // Points pushed behind the camera cost as much as a far outlier.
            None => 2.0 * k * 1e3,
        })
        .sum()
}

fn huber_weight(error_norm: f64, threshold: f64) -> f64 {
    if error_norm <= threshold {
        1.0
    } else {
        threshold / error_norm
    }
}

/// d(observed - projected) / d[w, v], columns rotation then translation.
fn jacobian(intrinsics: &CameraIntrinsics, p_cam: &Vector3<f64>) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    if z.abs() < 1e-6 {
        return Matrix2x6::zeros();
    }
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (intrinsics.fx, intrinsics.fy);

    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}
