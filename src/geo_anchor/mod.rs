//! Geo-anchoring: aligning the local map frame to geodetic coordinates.

pub mod resolver;
pub mod solver;
pub mod transform;

pub use resolver::{
    GeoAnchorConfig, GeoAnchorResolver, GeoAnchorState, GeoCorrespondence, LocationOutcome,
    PendingFix, PositionOutcome, RetryReport,
};
pub use solver::{gravity_axes, AnchorModel, InsufficientData};
pub use transform::GeoAnchorTransform;
