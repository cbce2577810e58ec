//! Pose graph container.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::SE3;
use crate::map::{KeyFrame, KeyFrameId};

/// Where a constraint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Consecutive keyframes along the tracked trajectory.
    Sequential,
    /// Keyframes sharing landmark observations.
    Covisibility,
}

/// Relative-pose constraint between two keyframes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub from: KeyFrameId,
    pub to: KeyFrameId,
    /// Measured `T_from^{-1} * T_to` at insertion time.
    pub measurement: SE3,
    /// Scalar information weight (inverse variance).
    pub information: f64,
    pub kind: ConstraintKind,
}

impl Constraint {
    /// Constraint whose measurement is the current relative pose of the two keyframes.
    pub fn between(from: &KeyFrame, to: &KeyFrame, kind: ConstraintKind, information: f64) -> Self {
        Self {
            from: from.id,
            to: to.id,
            measurement: from.pose.between(&to.pose),
            information,
            kind,
        }
    }

    pub fn touches(&self, id: KeyFrameId) -> bool {
        self.from == id || self.to == id
    }

    pub fn other(&self, id: KeyFrameId) -> KeyFrameId {
        if self.from == id {
            self.to
        } else {
            self.from
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoseGraphError {
    #[error("keyframe {0} is already in the graph")]
    Duplicate(KeyFrameId),

    #[error("constraint references unknown keyframe {0}")]
    UnknownKeyFrame(KeyFrameId),

    #[error("keyframe {0} has no constraint to the existing graph")]
    Disconnected(KeyFrameId),

    #[error("constraint {0} -> {1} does not involve the inserted keyframe")]
    ForeignConstraint(KeyFrameId, KeyFrameId),
}

/// Keyframes plus the constraints linking them. Always connected.
#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    constraints: Vec<Constraint>,
    /// Constraint indices per keyframe.
    adjacency: HashMap<KeyFrameId, Vec<usize>>,
    /// (timestamp, id) for temporal lookup.
    by_time: BTreeSet<(u64, KeyFrameId)>,
    next_id: u64,
    last_inserted: Option<KeyFrameId>,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next inserted keyframe should carry.
    pub fn next_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.next_id)
    }

    /// Insert a keyframe with its constraints to existing nodes.
    ///
    /// The first keyframe needs no constraints; every later one needs at
    /// least one, and each constraint must join the new keyframe to a node
    /// already present. Nothing is modified on error.
    pub fn insert(
        &mut self,
        keyframe: KeyFrame,
        constraints: Vec<Constraint>,
    ) -> Result<(), PoseGraphError> {
        let id = keyframe.id;
        if self.keyframes.contains_key(&id) {
            return Err(PoseGraphError::Duplicate(id));
        }
        for c in &constraints {
            if !c.touches(id) || c.from == c.to {
                return Err(PoseGraphError::ForeignConstraint(c.from, c.to));
            }
            let other = c.other(id);
            if !self.keyframes.contains_key(&other) {
                return Err(PoseGraphError::UnknownKeyFrame(other));
            }
        }
        if !self.keyframes.is_empty() && constraints.is_empty() {
            return Err(PoseGraphError::Disconnected(id));
        }

        self.by_time.insert((keyframe.timestamp_ns, id));
        self.keyframes.insert(id, keyframe);
        self.adjacency.entry(id).or_default();
        for c in constraints {
            self.push_constraint(c);
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.last_inserted = Some(id);

        debug!(keyframe = %id, nodes = self.keyframes.len(), edges = self.constraints.len(), "pose graph insert");
        Ok(())
    }

    fn push_constraint(&mut self, c: Constraint) {
        let idx = self.constraints.len();
        self.adjacency.entry(c.from).or_default().push(idx);
        self.adjacency.entry(c.to).or_default().push(idx);
        self.constraints.push(c);
    }

    /// Rebuild a graph from persisted parts, validating references and connectivity.
    pub fn from_parts(
        keyframes: Vec<KeyFrame>,
        constraints: Vec<Constraint>,
    ) -> Result<Self, PoseGraphError> {
        let mut graph = Self::new();
        for kf in keyframes {
            let id = kf.id;
            if graph.keyframes.contains_key(&id) {
                return Err(PoseGraphError::Duplicate(id));
            }
            graph.by_time.insert((kf.timestamp_ns, id));
            graph.adjacency.entry(id).or_default();
            graph.keyframes.insert(id, kf);
            graph.next_id = graph.next_id.max(id.0 + 1);
            graph.last_inserted = Some(graph.last_inserted.map_or(id, |last| last.max(id)));
        }
        for c in constraints {
            for end in [c.from, c.to] {
                if !graph.keyframes.contains_key(&end) {
                    return Err(PoseGraphError::UnknownKeyFrame(end));
                }
            }
            graph.push_constraint(c);
        }
        if let Some(isolated) = graph.first_unreachable() {
            return Err(PoseGraphError::Disconnected(isolated));
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    /// Keyframes in insertion (id) order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn constraints_of(&self, id: KeyFrameId) -> impl Iterator<Item = &Constraint> {
        self.adjacency
            .get(&id)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.constraints[idx])
    }

    /// Indices into [`PoseGraph::constraints`] touching `id`.
    pub(crate) fn constraint_indices_of(&self, id: KeyFrameId) -> &[usize] {
        self.adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn neighbors(&self, id: KeyFrameId) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.constraints_of(id).map(move |c| c.other(id))
    }

    /// Most recently inserted keyframe.
    pub fn last_keyframe(&self) -> Option<&KeyFrame> {
        self.last_inserted.and_then(|id| self.keyframes.get(&id))
    }

    /// The `n` most recently inserted keyframe ids, oldest first.
    pub fn recent_ids(&self, n: usize) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().rev().take(n).copied().collect();
        ids.reverse();
        ids
    }

    pub fn first_id(&self) -> Option<KeyFrameId> {
        self.keyframes.keys().next().copied()
    }

    /// Keyframe closest in time to `timestamp_ns`, if within `tolerance_ns`.
    pub fn nearest_in_time(&self, timestamp_ns: u64, tolerance_ns: u64) -> Option<&KeyFrame> {
        let after = self
            .by_time
            .range((timestamp_ns, KeyFrameId::new(0))..)
            .next();
        let before = self
            .by_time
            .range(..(timestamp_ns, KeyFrameId::new(0)))
            .next_back();

        [before, after]
            .into_iter()
            .flatten()
            .map(|&(ts, id)| (ts.abs_diff(timestamp_ns), id))
            .filter(|&(dt, _)| dt <= tolerance_ns)
            .min_by_key(|&(dt, _)| dt)
            .and_then(|(_, id)| self.keyframes.get(&id))
    }

    /// Overwrite a keyframe pose. Only refinement passes should call this.
    pub(crate) fn set_pose(&mut self, id: KeyFrameId, pose: SE3) -> bool {
        match self.keyframes.get_mut(&id) {
            Some(kf) => {
                kf.pose = pose;
                true
            }
            None => false,
        }
    }

    /// True when every keyframe is reachable from the first one.
    pub fn is_connected(&self) -> bool {
        self.first_unreachable().is_none()
    }

    fn first_unreachable(&self) -> Option<KeyFrameId> {
        let start = self.first_id()?;
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for n in self.neighbors(id) {
                if seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        self.keyframes.keys().find(|id| !seen.contains(id)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::CameraIntrinsics;
    use nalgebra::{UnitQuaternion, Vector3};

    fn keyframe(id: u64, x: f64, timestamp_ns: u64) -> KeyFrame {
        KeyFrame {
            id: KeyFrameId::new(id),
            timestamp_ns,
            pose: SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0)),
            intrinsics: CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480),
            features: Vec::new(),
            low_confidence: false,
        }
    }

    fn chain(n: u64) -> PoseGraph {
        let mut graph = PoseGraph::new();
        for i in 0..n {
            let kf = keyframe(i, i as f64 * 0.5, i * 500_000_000);
            let constraints = graph
                .last_keyframe()
                .map(|prev| vec![Constraint::between(prev, &kf, ConstraintKind::Sequential, 1.0)])
                .unwrap_or_default();
            graph.insert(kf, constraints).unwrap();
        }
        graph
    }

    #[test]
    fn test_insert_chain_stays_connected() {
        let graph = chain(5);
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.constraints().len(), 4);
        assert!(graph.is_connected());
        assert_eq!(graph.next_keyframe_id(), KeyFrameId::new(5));
        assert_eq!(graph.last_keyframe().unwrap().id, KeyFrameId::new(4));
    }

    #[test]
    fn test_isolated_keyframe_is_rejected_without_change() {
        let mut graph = chain(2);
        let err = graph.insert(keyframe(2, 1.0, 1), Vec::new()).unwrap_err();
        assert_eq!(err, PoseGraphError::Disconnected(KeyFrameId::new(2)));
        assert_eq!(graph.len(), 2);
        assert!(graph.keyframe(KeyFrameId::new(2)).is_none());
    }

    #[test]
    fn test_constraint_to_unknown_keyframe_is_rejected() {
        let mut graph = chain(1);
        let ghost = keyframe(9, 3.0, 0);
        let kf = keyframe(1, 0.5, 1);
        let c = Constraint::between(&ghost, &kf, ConstraintKind::Sequential, 1.0);
        assert_eq!(
            graph.insert(kf, vec![c]),
            Err(PoseGraphError::UnknownKeyFrame(KeyFrameId::new(9)))
        );
    }

    #[test]
    fn test_nearest_in_time() {
        let graph = chain(4); // 0, 0.5 s, 1.0 s, 1.5 s
        let kf = graph.nearest_in_time(1_100_000_000, 200_000_000).unwrap();
        assert_eq!(kf.id, KeyFrameId::new(2));
        let kf = graph.nearest_in_time(1_400_000_000, 200_000_000).unwrap();
        assert_eq!(kf.id, KeyFrameId::new(3));
        assert!(graph.nearest_in_time(5_000_000_000, 200_000_000).is_none());
    }

    #[test]
    fn test_recent_ids_oldest_first() {
        let graph = chain(5);
        let ids: Vec<u64> = graph.recent_ids(3).iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_from_parts_rejects_disconnected_graph() {
        let graph = chain(3);
        let keyframes: Vec<KeyFrame> = graph.keyframes().cloned().collect();
        let constraints = graph.constraints()[..1].to_vec();
        assert_eq!(
            PoseGraph::from_parts(keyframes.clone(), constraints).unwrap_err(),
            PoseGraphError::Disconnected(KeyFrameId::new(2))
        );

        let rebuilt = PoseGraph::from_parts(keyframes, graph.constraints().to_vec()).unwrap();
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(rebuilt.next_keyframe_id(), KeyFrameId::new(3));
    }
}
