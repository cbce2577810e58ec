//! Pose graph: keyframe poses as nodes, relative-pose constraints as edges.
//!
//! Two refinement tiers are kept as separate operations. `refine_local` runs
//! after every insertion on a bounded window of recent keyframes;
//! `refine_full` covers the whole graph and only runs at flush time.

pub mod graph;
pub mod optimizer;

pub use graph::{Constraint, ConstraintKind, PoseGraph, PoseGraphError};
pub use optimizer::{PoseGraphConfig, RefineReport, RefineScope};
