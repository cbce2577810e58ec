//! Keyframe selection: which tracked frames become permanent keyframes.
//!
//! A frame is promoted when it is the first of the session, when it moved or
//! turned far enough from the most recent keyframe, or when too much sensor
//! time passed without a keyframe (slow motion must not starve the map).

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::map::KeyFrame;

/// Thresholds for keyframe promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeSelectorConfig {
    /// Translation from the last keyframe that triggers a new one (metres).
    pub min_translation_m: f64,
    /// Rotation from the last keyframe that triggers a new one (radians).
    pub min_rotation_rad: f64,
    /// Maximum sensor time between keyframes (seconds).
    pub max_interval_s: f64,
}

impl Default for KeyframeSelectorConfig {
    fn default() -> Self {
        Self {
            min_translation_m: 0.25,
            min_rotation_rad: 15f64.to_radians(),
            max_interval_s: 2.0,
        }
    }
}

/// Why a frame was promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    FirstFrame,
    Translation,
    Rotation,
    MaxInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Accept(AcceptReason),
    Reject,
}

impl Selection {
    pub fn is_accept(&self) -> bool {
        matches!(self, Selection::Accept(_))
    }
}

/// Stateless with respect to the map; it only counts frames it has seen.
pub struct KeyframeSelector {
    config: KeyframeSelectorConfig,
    frames_since_keyframe: usize,
}

impl KeyframeSelector {
    pub fn new(config: KeyframeSelectorConfig) -> Self {
        Self {
            config,
            frames_since_keyframe: 0,
        }
    }

    /// Decide on a candidate frame given the most recent keyframe, if any.
    pub fn select(
        &mut self,
        pose: &SE3,
        timestamp_ns: u64,
        last_keyframe: Option<&KeyFrame>,
    ) -> Selection {
        let decision = self.evaluate(pose, timestamp_ns, last_keyframe);
        if decision.is_accept() {
            self.frames_since_keyframe = 0;
        } else {
            self.frames_since_keyframe += 1;
        }
        decision
    }

    fn evaluate(&self, pose: &SE3, timestamp_ns: u64, last_keyframe: Option<&KeyFrame>) -> Selection {
        let Some(last) = last_keyframe else {
            return Selection::Accept(AcceptReason::FirstFrame);
        };

        if pose.translation_distance(&last.pose) > self.config.min_translation_m {
            return Selection::Accept(AcceptReason::Translation);
        }
        if pose.rotation_angle(&last.pose) > self.config.min_rotation_rad {
            return Selection::Accept(AcceptReason::Rotation);
        }

        // abs_diff: an out-of-order frame is judged by distance in time
        let elapsed_s = timestamp_ns.abs_diff(last.timestamp_ns) as f64 * 1e-9;
        if elapsed_s > self.config.max_interval_s {
            return Selection::Accept(AcceptReason::MaxInterval);
        }

        Selection::Reject
    }

    /// Frames rejected since the last accepted keyframe.
    pub fn frames_since_keyframe(&self) -> usize {
        self.frames_since_keyframe
    }

    pub fn config(&self) -> &KeyframeSelectorConfig {
        &self.config
    }
}

impl Default for KeyframeSelector {
    fn default() -> Self {
        Self::new(KeyframeSelectorConfig::default())
    }
}
