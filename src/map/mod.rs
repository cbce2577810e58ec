//! Map entities: keyframes (owned by the pose graph) and landmarks (owned by
//! the landmark tracker). They refer to each other only through ids.

pub mod keyframe;
pub mod landmark;
pub mod types;

pub use keyframe::KeyFrame;
pub use landmark::{Landmark, LandmarkStatus, Observation};
pub use types::{KeyFrameId, LandmarkId};
