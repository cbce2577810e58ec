//! Aggregated session configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::geo_anchor::GeoAnchorConfig;
use crate::io::MapStoreConfig;
use crate::landmarks::LandmarkTrackerConfig;
use crate::pose_graph::PoseGraphConfig;
use crate::tracking::{KeyframeSelectorConfig, PoseEstimationConfig};

/// Every tunable of a mapping session. Missing fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub keyframe_selector: KeyframeSelectorConfig,
    pub landmarks: LandmarkTrackerConfig,
    pub pose_estimation: PoseEstimationConfig,
    pub pose_graph: PoseGraphConfig,
    pub geo_anchor: GeoAnchorConfig,
    pub store: MapStoreConfig,
}

impl MapperConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        serde_json::from_str(&text).map_err(|source| StorageError::Serialization {
            path: path.to_path_buf(),
            source,
        })
    }
}
