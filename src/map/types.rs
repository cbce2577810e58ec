//! Id types for map entities.

use serde::{Deserialize, Serialize};

/// Identifier of a keyframe within a session.
///
/// Assigned sequentially on insertion, so ordering by id is insertion order.
/// Ids are plain handles; nothing holds a keyframe through its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a landmark (pending or confirmed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}
