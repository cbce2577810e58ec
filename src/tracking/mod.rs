//! Frame-level decisions: keyframe selection, descriptor matching and the
//! landmark-based pose of a new keyframe.

pub mod keyframe_selector;
pub mod matching;
pub mod pose_estimation;

pub use keyframe_selector::{AcceptReason, KeyframeSelector, KeyframeSelectorConfig, Selection};
pub use matching::{best_match, DescriptorMatch, FeatureGrid, NN_RATIO, TH_LOW};
pub use pose_estimation::{estimate_pose, PoseCorrespondence, PoseEstimate, PoseEstimationConfig};
