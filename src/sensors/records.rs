//! Plain-data sensor records.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{CameraIntrinsics, Feature, FrameObservation, GeolocationFix};
use crate::geometry::{GeoCoordinate, SE3};

/// A frame already tracked by the AR subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedFrame {
    pub timestamp_ns: u64,
    pub pose: SE3,
    pub intrinsics: CameraIntrinsics,
    pub features: Vec<Feature>,
}

impl FrameObservation for TrackedFrame {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn pose(&self) -> SE3 {
        self.pose
    }

    fn intrinsics(&self) -> CameraIntrinsics {
        self.intrinsics
    }

    fn features(&self) -> &[Feature] {
        &self.features
    }
}

/// A geolocation fix with 1-sigma accuracies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub timestamp_ns: u64,
    pub coordinate: GeoCoordinate,
    pub horizontal_accuracy_m: f64,
    pub vertical_accuracy_m: f64,
}

impl LocationFix {
    pub fn new(
        timestamp_ns: u64,
        coordinate: GeoCoordinate,
        horizontal_accuracy_m: f64,
        vertical_accuracy_m: f64,
    ) -> Self {
        Self {
            timestamp_ns,
            coordinate,
            horizontal_accuracy_m,
            vertical_accuracy_m,
        }
    }

    /// Copy any fix implementation into a plain record.
    pub fn from_fix<L: GeolocationFix + ?Sized>(fix: &L) -> Self {
        Self {
            timestamp_ns: fix.timestamp_ns(),
            coordinate: fix.coordinate(),
            horizontal_accuracy_m: fix.horizontal_accuracy_m(),
            vertical_accuracy_m: fix.vertical_accuracy_m(),
        }
    }
}

impl GeolocationFix for LocationFix {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn coordinate(&self) -> GeoCoordinate {
        self.coordinate
    }

    fn horizontal_accuracy_m(&self) -> f64 {
        self.horizontal_accuracy_m
    }

    fn vertical_accuracy_m(&self) -> f64 {
        self.vertical_accuracy_m
    }
}

/// A 3D point in the position supplier's frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub timestamp_ns: u64,
    pub position: Vector3<f64>,
}

impl PositionSample {
    pub fn new(position: Vector3<f64>, timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            position,
        }
    }
}
