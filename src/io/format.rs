//! On-disk records of a stored map generation.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::MapperConfig;
use crate::error::StorageError;
use crate::geo_anchor::{GeoAnchorResolver, GeoAnchorState};
use crate::landmarks::LandmarkTracker;
use crate::map::{KeyFrame, Landmark};
use crate::pose_graph::{Constraint, PoseGraph};

/// Bumped on any incompatible change to the records below.
pub const FORMAT_VERSION: u32 = 1;

pub const CURRENT_FILE: &str = "CURRENT";
pub const GENERATIONS_DIR: &str = "generations";
pub const METADATA_FILE: &str = "metadata.json";
pub const POSE_GRAPH_FILE: &str = "pose_graph.json";
pub const LANDMARKS_FILE: &str = "landmarks.json";
pub const GEO_ANCHOR_FILE: &str = "geo_anchor.json";
pub const CONFIG_FILE: &str = "config.json";

/// Stable identity of a session across saves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub created_at_ms: u64,
}

impl SessionIdentity {
    pub fn generate() -> Self {
        Self {
            session_id: format!("{:032x}", rand::random::<u128>()),
            created_at_ms: unix_time_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMetadata {
    pub format_version: u32,
    pub session_id: String,
    pub generation: u64,
    pub created_at_ms: u64,
    pub modified_at_ms: u64,
    pub keyframe_count: usize,
    /// Confirmed landmarks only.
    pub landmark_count: usize,
    pub pending_landmark_count: usize,
    pub constraint_count: usize,
    pub correspondence_count: usize,
    pub low_confidence_inputs: u64,
    pub has_geo_anchor: bool,
}

impl MapMetadata {
    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            session_id: self.session_id.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

/// Read first so a newer layout reports a version mismatch, not corruption.
#[derive(Debug, Deserialize)]
pub(crate) struct VersionProbe {
    pub format_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoseGraphRecord {
    pub keyframes: Vec<KeyFrame>,
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LandmarksRecord {
    pub landmarks: Vec<Landmark>,
}

/// Everything one generation holds.
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    pub metadata: MapMetadata,
    pub pose_graph: PoseGraphRecord,
    pub landmarks: LandmarksRecord,
    pub geo_anchor: GeoAnchorState,
    pub config: MapperConfig,
}

/// A snapshot rebuilt into live components.
pub struct RestoredMap {
    pub metadata: MapMetadata,
    pub graph: PoseGraph,
    pub tracker: LandmarkTracker,
    pub resolver: GeoAnchorResolver,
    /// Configuration the map was written with.
    pub stored_config: MapperConfig,
}

impl MapSnapshot {
    /// Copy the session components. The generation is assigned by the store.
    pub fn capture(
        identity: &SessionIdentity,
        low_confidence_inputs: u64,
        graph: &PoseGraph,
        tracker: &LandmarkTracker,
        resolver: &GeoAnchorResolver,
        config: &MapperConfig,
    ) -> Self {
        let geo_anchor = resolver.state();
        let metadata = MapMetadata {
            format_version: FORMAT_VERSION,
            session_id: identity.session_id.clone(),
            generation: 0,
            created_at_ms: identity.created_at_ms,
            modified_at_ms: unix_time_ms(),
            keyframe_count: graph.len(),
            landmark_count: tracker.confirmed_count(),
            pending_landmark_count: tracker.pending_count(),
            constraint_count: graph.constraints().len(),
            correspondence_count: geo_anchor.correspondences.len(),
            low_confidence_inputs,
            has_geo_anchor: geo_anchor.transform.is_some(),
        };
        Self {
            metadata,
            pose_graph: PoseGraphRecord {
                keyframes: graph.keyframes().cloned().collect(),
                constraints: graph.constraints().to_vec(),
            },
            landmarks: LandmarksRecord {
                landmarks: tracker.landmarks().cloned().collect(),
            },
            geo_anchor,
            config: config.clone(),
        }
    }

    /// Metadata counts must describe the records next to them.
    pub fn check_counts(&self, path: &Path) -> Result<(), StorageError> {
        let m = &self.metadata;
        let confirmed = self
            .landmarks
            .landmarks
            .iter()
            .filter(|lm| lm.is_confirmed())
            .count();
        let checks = [
            ("keyframe", m.keyframe_count, self.pose_graph.keyframes.len()),
            ("constraint", m.constraint_count, self.pose_graph.constraints.len()),
            ("landmark", m.landmark_count, confirmed),
            (
                "pending landmark",
                m.pending_landmark_count,
                self.landmarks.landmarks.len() - confirmed,
            ),
            (
                "correspondence",
                m.correspondence_count,
                self.geo_anchor.correspondences.len(),
            ),
        ];
        for (what, recorded, found) in checks {
            if recorded != found {
                return Err(StorageError::corrupt(
                    path,
                    format!("metadata records {recorded} {what}s, found {found}"),
                ));
            }
        }
        if m.has_geo_anchor != self.geo_anchor.transform.is_some() {
            return Err(StorageError::corrupt(path, "geo anchor presence disagrees with metadata"));
        }
        Ok(())
    }

    /// Rebuild the live components with the tunables of `config`,
    /// validating every cross reference.
    pub fn restore(self, path: &Path, config: &MapperConfig) -> Result<RestoredMap, StorageError> {
        let graph = PoseGraph::from_parts(self.pose_graph.keyframes, self.pose_graph.constraints)
            .map_err(|e| StorageError::corrupt(path, e.to_string()))?;
        let tracker =
            LandmarkTracker::from_parts(config.landmarks.clone(), self.landmarks.landmarks, &graph)
                .map_err(|e| StorageError::corrupt(path, e.to_string()))?;

        if let Some(c) = self
            .geo_anchor
            .correspondences
            .iter()
            .find(|c| graph.keyframe(c.keyframe_id).is_none())
        {
            return Err(StorageError::corrupt(
                path,
                format!("correspondence references unknown keyframe {}", c.keyframe_id),
            ));
        }
        let resolver = GeoAnchorResolver::from_state(config.geo_anchor.clone(), self.geo_anchor);

        Ok(RestoredMap {
            metadata: self.metadata,
            graph,
            tracker,
            resolver,
            stored_config: self.config,
        })
    }
}

pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
