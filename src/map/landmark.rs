//! Landmark - a 3D point inferred from multi-view feature observations.
//!
//! A landmark starts as a pending candidate created from a single unmatched
//! feature. It becomes confirmed once triangulation from at least two
//! well-separated observations succeeds; only then does it carry a position.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::types::{KeyFrameId, LandmarkId};
use crate::sensors::Descriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandmarkStatus {
    Pending,
    Confirmed,
}

/// A keyframe observing a landmark at one of its features.
///
/// This is a non-owning back-reference: the keyframe lives in the pose graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub keyframe_id: KeyFrameId,
    pub feature_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Landmark {
    pub id: LandmarkId,

    pub status: LandmarkStatus,

    /// Map-frame position; `None` while pending.
    pub position: Option<Vector3<f64>>,

    /// Descriptor of the most recent observation.
    pub descriptor: Descriptor,

    /// Observations ordered by keyframe id.
    pub observations: Vec<Observation>,

    /// Sensor time of the keyframe that created the candidate.
    pub first_seen_ns: u64,

    /// Sensor time of the newest observing keyframe.
    pub last_seen_ns: u64,

    /// Triangulation attempts that failed on degenerate geometry.
    #[serde(default)]
    pub failed_triangulations: u32,
}

impl Landmark {
    /// Pending candidate created from a single unmatched feature.
    pub fn candidate(
        id: LandmarkId,
        observation: Observation,
        descriptor: Descriptor,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            id,
            status: LandmarkStatus::Pending,
            position: None,
            descriptor,
            observations: vec![observation],
            first_seen_ns: timestamp_ns,
            last_seen_ns: timestamp_ns,
            failed_triangulations: 0,
        }
    }

    /// Add or replace the observation from `observation.keyframe_id`.
    pub fn add_observation(
        &mut self,
        observation: Observation,
        descriptor: Descriptor,
        timestamp_ns: u64,
    ) {
        match self
            .observations
            .binary_search_by_key(&observation.keyframe_id, |o| o.keyframe_id)
        {
            Ok(idx) => self.observations[idx] = observation,
            Err(idx) => self.observations.insert(idx, observation),
        }
        self.descriptor = descriptor;
        self.last_seen_ns = self.last_seen_ns.max(timestamp_ns);
        self.first_seen_ns = self.first_seen_ns.min(timestamp_ns);
    }

    /// Returns true if an observation from `keyframe_id` was removed.
    pub fn erase_observation(&mut self, keyframe_id: KeyFrameId) -> bool {
        let before = self.observations.len();
        self.observations.retain(|o| o.keyframe_id != keyframe_id);
        self.observations.len() != before
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == LandmarkStatus::Confirmed
    }

    pub fn confirm(&mut self, position: Vector3<f64>) {
        self.position = Some(position);
        self.status = LandmarkStatus::Confirmed;
    }

    /// Confirmed and seen from at least `min_observations` keyframes.
    pub fn is_usable(&self, min_observations: usize) -> bool {
        self.is_confirmed() && self.observations.len() >= min_observations
    }

    /// Confidence in `[0, 1)`, growing with the number of observing keyframes.
    pub fn confidence(&self) -> f64 {
        if !self.is_confirmed() || self.observations.is_empty() {
            return 0.0;
        }
        1.0 - 1.0 / self.observations.len() as f64
    }

    /// Time pending, measured against `now_ns`.
    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.first_seen_ns)
    }

    pub fn observed_by(&self, keyframe_id: KeyFrameId) -> bool {
        self.observations
            .binary_search_by_key(&keyframe_id, |o| o.keyframe_id)
            .is_ok()
    }
}
