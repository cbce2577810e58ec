//! Landmark management: association of keyframe features with persistent
//! landmarks, multi-view triangulation and pruning of stale candidates.

pub mod tracker;
pub mod triangulation;

pub use tracker::{AssociationReport, LandmarkTracker, LandmarkTrackerConfig, RestoreError};
pub use triangulation::{triangulate, TriangulationConfig, TriangulationFailure, View};
