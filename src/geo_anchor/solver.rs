//! Closed-form similarity solvers from local map points to ENU points.
//!
//! Both solvers are weighted least squares over the full correspondence set:
//!
//! * [`solve_gravity_aligned`]: 4 DOF (yaw, scale, translation). The local
//!   frame is already gravity-aligned, so only the horizontal components carry
//!   rotation information. Solved as a complex-number Umeyama fit.
//! * [`solve_full`]: 7 DOF weighted Horn/Umeyama with SVD.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::so3::rotation_z;
use crate::geometry::Sim3;

/// Which similarity model the resolver fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AnchorModel {
    /// Yaw, scale and translation on top of the fixed up-axis mapping.
    #[default]
    GravityAligned,
    /// Unconstrained rotation, scale and translation.
    Full,
}

impl AnchorModel {
    pub fn min_correspondences(self) -> usize {
        match self {
            AnchorModel::GravityAligned => 2,
            AnchorModel::Full => 3,
        }
    }
}

/// Why a solve produced no transform.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InsufficientData {
    #[error("{found} correspondences, at least {required} needed")]
    TooFewCorrespondences { found: usize, required: usize },

    #[error("fixes span {separation_m:.2} m, at least {required_m:.2} m needed")]
    NearDuplicate { separation_m: f64, required_m: f64 },

    #[error("correspondences are nearly collinear (spread ratio {ratio:.4})")]
    Collinear { ratio: f64 },

    #[error("implausible scale {scale:.4}")]
    ImplausibleScale { scale: f64 },

    #[error("degenerate solve: {0}")]
    Degenerate(String),
}

/// One weighted point pair.
#[derive(Debug, Clone, Copy)]
pub struct WeightedPair {
    pub local: Vector3<f64>,
    pub enu: Vector3<f64>,
    pub horizontal_weight: f64,
    pub vertical_weight: f64,
}

/// Thresholds shared by both solvers.
#[derive(Debug, Clone, Copy)]
pub struct SolveLimits {
    pub min_separation_m: f64,
    pub collinearity_threshold: f64,
    pub max_scale_deviation: f64,
}

/// Fixed rotation taking the y-up local axes onto ENU: (x, y, z) -> (x, -z, y).
pub fn gravity_axes() -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::FRAC_PI_2)
}

/// Dispatch on `model`.
pub fn solve(
    model: AnchorModel,
    pairs: &[WeightedPair],
    limits: &SolveLimits,
) -> Result<Sim3, InsufficientData> {
    let required = model.min_correspondences();
    if pairs.len() < required {
        return Err(InsufficientData::TooFewCorrespondences {
            found: pairs.len(),
            required,
        });
    }
    check_separation(pairs, limits.min_separation_m)?;

    let sim3 = match model {
        AnchorModel::GravityAligned => solve_gravity_aligned(pairs)?,
        AnchorModel::Full => solve_full(pairs, limits.collinearity_threshold)?,
    };

    let d = limits.max_scale_deviation;
    if !sim3.scale.is_finite() || sim3.scale > 1.0 + d || sim3.scale < 1.0 / (1.0 + d) {
        return Err(InsufficientData::ImplausibleScale { scale: sim3.scale });
    }
    Ok(sim3)
}

/// Largest horizontal distance between any two fixes.
fn check_separation(pairs: &[WeightedPair], required_m: f64) -> Result<(), InsufficientData> {
    let mut separation_m: f64 = 0.0;
    for (i, a) in pairs.iter().enumerate() {
        for b in &pairs[i + 1..] {
            separation_m = separation_m.max((a.enu.xy() - b.enu.xy()).norm());
        }
    }
    if separation_m < required_m {
        return Err(InsufficientData::NearDuplicate {
            separation_m,
            required_m,
        });
    }
    Ok(())
}

fn weighted_centroid(points: impl Iterator<Item = (Vector3<f64>, f64)>) -> Option<Vector3<f64>> {
    let mut sum = Vector3::zeros();
    let mut total = 0.0;
    for (p, w) in points {
        sum += p * w;
        total += w;
    }
    (total > 0.0).then(|| sum / total)
}

/// enu = s * Rz(yaw) * P * local + t.
pub fn solve_gravity_aligned(pairs: &[WeightedPair]) -> Result<Sim3, InsufficientData> {
    let axes = gravity_axes();
    let aligned: Vec<Vector3<f64>> = pairs.iter().map(|p| axes * p.local).collect();

    let local_centroid = weighted_centroid(
        aligned.iter().zip(pairs).map(|(a, p)| (*a, p.horizontal_weight)),
    )
    .ok_or_else(|| InsufficientData::Degenerate("zero total weight".into()))?;
    let enu_centroid = weighted_centroid(pairs.iter().map(|p| (p.enu, p.horizontal_weight)))
        .ok_or_else(|| InsufficientData::Degenerate("zero total weight".into()))?;

    // c = sum w conj(a) b / sum w |a|^2 with a, b as complex numbers x + iy
    let (mut re, mut im, mut norm) = (0.0, 0.0, 0.0);
    for (a, p) in aligned.iter().zip(pairs) {
        let a = a - local_centroid;
        let b = p.enu - enu_centroid;
        let w = p.horizontal_weight;
        re += w * (a.x * b.x + a.y * b.y);
        im += w * (a.x * b.y - a.y * b.x);
        norm += w * (a.x * a.x + a.y * a.y);
    }
    if norm < 1e-12 {
        return Err(InsufficientData::Degenerate(
            "local points have no horizontal spread".into(),
        ));
    }

    let scale = (re * re + im * im).sqrt() / norm;
    let yaw = im.atan2(re);
    let yaw_rotation = rotation_z(yaw);

    let horizontal = enu_centroid - scale * (yaw_rotation * local_centroid);

    // Vertical offset: weighted mean of enu_z - s * local_z.
    let (mut dz, mut wz) = (0.0, 0.0);
    for (a, p) in aligned.iter().zip(pairs) {
        dz += p.vertical_weight * (p.enu.z - scale * a.z);
        wz += p.vertical_weight;
    }
    if wz <= 0.0 {
        return Err(InsufficientData::Degenerate("zero vertical weight".into()));
    }

    Ok(Sim3 {
        rotation: yaw_rotation * axes,
        translation: Vector3::new(horizontal.x, horizontal.y, dz / wz),
        scale,
    })
}

/// Weighted Umeyama: enu = s * R * local + t.
pub fn solve_full(pairs: &[WeightedPair], collinearity_threshold: f64) -> Result<Sim3, InsufficientData> {
    let local_centroid = weighted_centroid(pairs.iter().map(|p| (p.local, p.horizontal_weight)))
        .ok_or_else(|| InsufficientData::Degenerate("zero total weight".into()))?;
    let enu_centroid = weighted_centroid(pairs.iter().map(|p| (p.enu, p.horizontal_weight)))
        .ok_or_else(|| InsufficientData::Degenerate("zero total weight".into()))?;

    let mut spread = Matrix3::zeros();
    let mut cross = Matrix3::zeros();
    let mut variance = 0.0;
    for p in pairs {
        let a = p.local - local_centroid;
        let b = p.enu - enu_centroid;
        let w = p.horizontal_weight;
        spread += w * a * a.transpose();
        cross += w * b * a.transpose();
        variance += w * a.norm_squared();
    }

    // Singular values of the weighted scatter, largest first.
    let mut extent = spread.symmetric_eigenvalues().map(|v| v.max(0.0).sqrt());
    extent
        .as_mut_slice()
        .sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    if extent[0] < 1e-9 {
        return Err(InsufficientData::Degenerate("local points coincide".into()));
    }
    let ratio = extent[1] / extent[0];
    if ratio < collinearity_threshold {
        return Err(InsufficientData::Collinear { ratio });
    }

    let svd = cross.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(InsufficientData::Degenerate("SVD did not converge".into()));
    };

    let mut d = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let rotation = u * d * v_t;
    let scale = (svd.singular_values.component_mul(&d.diagonal())).sum() / variance;

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
    let translation = enu_centroid - scale * (rotation * local_centroid);
    Ok(Sim3 {
        rotation,
        translation,
        scale,
    })
}

/// Root mean square distance between transformed local points and fixes.
pub fn rms_error(sim3: &Sim3, pairs: &[WeightedPair]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let sum: f64 = pairs
        .iter()
        .map(|p| (sim3.transform_point(&p.local) - p.enu).norm_squared())
        .sum();
    (sum / pairs.len() as f64).sqrt()
}
