//! WGS84 geodetic coordinates and the local East-North-Up tangent frame.
//!
//! Geo-anchoring works in a metric ENU frame centred on a reference fix so the
//! similarity solve never sees raw degrees. Conversions go through ECEF and are
//! exact up to the iteration tolerance of the inverse.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// WGS84 semi-major axis (m).
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// First eccentricity squared.
const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

const ECEF_TO_GEODETIC_ITERATIONS: usize = 8;

/// Absolute geolocation (degrees, metres above the ellipsoid).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl GeoCoordinate {
    pub fn new(latitude_deg: f64, longitude_deg: f64, altitude_m: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
            altitude_m,
        }
    }

    /// Latitude within ±90°, longitude within ±180°, all components finite.
    pub fn is_valid(&self) -> bool {
        self.latitude_deg.is_finite()
            && self.longitude_deg.is_finite()
            && self.altitude_m.is_finite()
            && self.latitude_deg.abs() <= 90.0
            && self.longitude_deg.abs() <= 180.0
    }

    /// Earth-centred, earth-fixed position in metres.
    pub fn to_ecef(&self) -> Vector3<f64> {
        let lat = self.latitude_deg.to_radians();
        let lon = self.longitude_deg.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        let h = self.altitude_m;

        Vector3::new(
            (n + h) * cos_lat * cos_lon,
            (n + h) * cos_lat * sin_lon,
            (n * (1.0 - WGS84_E2) + h) * sin_lat,
        )
    }

    /// Inverse of [`GeoCoordinate::to_ecef`] by fixed-point iteration on latitude.
    pub fn from_ecef(ecef: &Vector3<f64>) -> Self {
        let lon = ecef.y.atan2(ecef.x);
        let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();

        let mut lat = ecef.z.atan2(p * (1.0 - WGS84_E2));
        let mut h = 0.0;
        for _ in 0..ECEF_TO_GEODETIC_ITERATIONS {
            let sin_lat = lat.sin();
            let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
            h = if lat.cos().abs() > 1e-9 {
                p / lat.cos() - n
            } else {
                ecef.z.abs() / sin_lat.abs() - n * (1.0 - WGS84_E2)
            };
            lat = ecef.z.atan2(p * (1.0 - WGS84_E2 * n / (n + h)));
        }

        Self {
            latitude_deg: lat.to_degrees(),
            longitude_deg: lon.to_degrees(),
            altitude_m: h,
        }
    }
}

/// East-North-Up frame tangent to the ellipsoid at `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalTangentFrame {
    pub origin: GeoCoordinate,
    origin_ecef: Vector3<f64>,
    /// Rows are the east, north and up axes expressed in ECEF.
    ecef_to_enu: Matrix3<f64>,
}

impl LocalTangentFrame {
    pub fn new(origin: GeoCoordinate) -> Self {
        let lat = origin.latitude_deg.to_radians();
        let lon = origin.longitude_deg.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();

        let ecef_to_enu = Matrix3::new(
            -sin_lon, cos_lon, 0.0,
            -sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat,
            cos_lat * cos_lon, cos_lat * sin_lon, sin_lat,
        );

        Self {
            origin,
            origin_ecef: origin.to_ecef(),
            ecef_to_enu,
        }
    }

    pub fn to_enu(&self, coordinate: &GeoCoordinate) -> Vector3<f64> {
        self.ecef_to_enu * (coordinate.to_ecef() - self.origin_ecef)
    }

    pub fn to_geodetic(&self, enu: &Vector3<f64>) -> GeoCoordinate {
        let ecef = self.ecef_to_enu.transpose() * enu + self.origin_ecef;
        GeoCoordinate::from_ecef(&ecef)
    }
}
