//! Capability interfaces for the external sensor suppliers.
//!
//! The mapping engine never sees platform SDK types. A frame supplier hands over
//! anything implementing [`FrameObservation`]; a location supplier hands over
//! anything implementing [`GeolocationFix`]. [`TrackedFrame`] and
//! [`LocationFix`] are the plain-data implementations used by the simulation,
//! the CLI and the tests.

pub mod camera;
pub mod feature;
pub mod records;

pub use camera::CameraIntrinsics;
pub use feature::{Descriptor, Feature, DESCRIPTOR_BYTES};
pub use records::{LocationFix, PositionSample, TrackedFrame};

use crate::error::ObservationError;
use crate::geometry::{GeoCoordinate, SE3};

/// Produces a pose-stamped feature frame.
///
/// The pose is camera-to-local-map (`T_wc`) as estimated by the AR tracker.
pub trait FrameObservation {
    fn timestamp_ns(&self) -> u64;
    fn pose(&self) -> SE3;
    fn intrinsics(&self) -> CameraIntrinsics;
    fn features(&self) -> &[Feature];
}

/// Produces a timestamped geolocation fix.
pub trait GeolocationFix {
    fn timestamp_ns(&self) -> u64;
    fn coordinate(&self) -> GeoCoordinate;
    /// 1-sigma horizontal accuracy in metres.
    fn horizontal_accuracy_m(&self) -> f64;
    /// 1-sigma vertical accuracy in metres.
    fn vertical_accuracy_m(&self) -> f64;
}

/// Reject frames whose content cannot be used at all.
pub fn validate_frame<F: FrameObservation + ?Sized>(frame: &F) -> Result<(), ObservationError> {
    if !frame.pose().is_finite() {
        return Err(ObservationError::TransientInput(
            "frame pose is not finite".into(),
        ));
    }
    let intrinsics = frame.intrinsics();
    if !intrinsics.is_valid() {
        return Err(ObservationError::TransientInput(format!(
            "invalid intrinsics fx={} fy={}",
            intrinsics.fx, intrinsics.fy
        )));
    }
    if let Some(idx) = frame
        .features()
        .iter()
        .position(|f| !f.u.is_finite() || !f.v.is_finite())
    {
        return Err(ObservationError::TransientInput(format!(
            "feature {idx} has a non-finite keypoint"
        )));
    }
    Ok(())
}

/// Reject fixes that are out of range or carry an unusable accuracy.
pub fn validate_fix<L: GeolocationFix + ?Sized>(fix: &L) -> Result<(), ObservationError> {
    let coordinate = fix.coordinate();
    if !coordinate.is_valid() {
        return Err(ObservationError::TransientInput(format!(
            "coordinate out of range: {:.6}, {:.6}",
            coordinate.latitude_deg, coordinate.longitude_deg
        )));
    }
    let horizontal = fix.horizontal_accuracy_m();
    let vertical = fix.vertical_accuracy_m();
    if !(horizontal.is_finite() && horizontal >= 0.0) || !(vertical.is_finite() && vertical >= 0.0) {
        return Err(ObservationError::TransientInput(format!(
            "invalid accuracy h={horizontal} v={vertical}"
        )));
    }
    Ok(())
}
