//! Geometry value types shared by every subsystem: rigid poses, similarity
//! transforms and geodetic coordinates.

pub mod geodetic;
pub mod se3;
pub mod sim3;
pub mod so3;

pub use geodetic::{GeoCoordinate, LocalTangentFrame};
pub use se3::SE3;
pub use sim3::Sim3;
