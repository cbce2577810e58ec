use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::AnchorModel;
use crate::geometry::{GeoCoordinate, LocalTangentFrame, Sim3};

/// Resolved mapping from the local map frame to geodetic coordinates.
///
/// Advisory only: the map itself stays in local coordinates and consumers
/// apply this on read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoAnchorTransform {
    /// Local map point to ENU point around `frame.origin`.
    pub local_to_enu: Sim3,
    pub frame: LocalTangentFrame,
    pub model: AnchorModel,
    pub rms_error_m: f64,
    pub correspondence_count: usize,
}

impl GeoAnchorTransform {
    pub fn local_to_geo(&self, local: &Vector3<f64>) -> GeoCoordinate {
        self.frame.to_geodetic(&self.local_to_enu.transform_point(local))
    }

    pub fn geo_to_local(&self, coordinate: &GeoCoordinate) -> Vector3<f64> {
        self.local_to_enu
            .inverse()
            .transform_point(&self.frame.to_enu(coordinate))
    }

    pub fn scale(&self) -> f64 {
        self.local_to_enu.scale
    }

    /// Heading of the local +x axis, counter-clockwise from east.
    pub fn yaw_rad(&self) -> f64 {
        let x = self.local_to_enu.rotation * Vector3::x();
        x.y.atan2(x.x)
    }
}
