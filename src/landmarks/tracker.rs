//! Landmark tracker.
//!
//! For every new keyframe:
//! 1. Build the working set from landmarks seen by recent keyframes
//! 2. Match confirmed landmarks by projection into the keyframe
//! 3. Match pending candidates along their epipolar line
//! 4. Spawn candidates from unmatched features
//! 5. Triangulate candidates that gained a view, refit confirmed ones
//! 6. Prune candidates pending longer than the retention window
//!
//! Association never looks beyond the working set, so per-keyframe cost stays
//! flat as the map grows.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::triangulation::{self, TriangulationConfig, View};
use crate::error::ObservationError;
use crate::geometry::so3::skew;
use crate::map::{KeyFrame, KeyFrameId, Landmark, LandmarkId, LandmarkStatus, Observation};
use crate::pose_graph::PoseGraph;
use crate::tracking::matching::{best_match, FeatureGrid, NN_RATIO, TH_LOW};

/// Configuration for landmark association and lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkTrackerConfig {
    /// Recent keyframes whose landmarks form the association working set.
    pub working_set_keyframes: usize,
    /// Hard cap on the working set size.
    pub max_working_set: usize,
    /// Maximum Hamming distance for a descriptor match.
    pub max_descriptor_distance: u32,
    /// Best / second-best ratio test.
    pub nn_ratio: f64,
    /// Search radius around a confirmed landmark's projection (pixels).
    pub projection_radius_px: f64,
    /// Maximum distance from the epipolar line for candidate matches (pixels).
    pub epipolar_threshold_px: f64,
    /// Sensor time a candidate may stay pending before it is pruned (seconds).
    pub pending_retention_s: f64,
    /// Shared landmarks needed for a covisibility constraint.
    pub min_covisible_landmarks: usize,
    /// Covisibility constraints per inserted keyframe.
    pub max_covisibility_constraints: usize,
    /// Observations needed for a confirmed landmark to count as usable.
    pub min_usable_observations: usize,
    pub triangulation: TriangulationConfig,
}

impl Default for LandmarkTrackerConfig {
    fn default() -> Self {
        Self {
            working_set_keyframes: 8,
            max_working_set: 4000,
            max_descriptor_distance: TH_LOW,
            nn_ratio: NN_RATIO,
            projection_radius_px: 15.0,
            epipolar_threshold_px: 4.0,
            pending_retention_s: 5.0,
            min_covisible_landmarks: 10,
            max_covisibility_constraints: 5,
            min_usable_observations: 3,
            triangulation: TriangulationConfig::default(),
        }
    }
}

/// Result of associating one keyframe.
#[derive(Debug, Clone, Default)]
pub struct AssociationReport {
    /// Every (landmark, observation) pair recorded for the keyframe,
    /// including freshly spawned candidates.
    pub associations: Vec<(LandmarkId, Observation)>,
    /// Map positions of the confirmed landmarks this keyframe matched,
    /// taken before any refit, with the matching feature index.
    pub landmark_matches: Vec<(Vector3<f64>, usize)>,
    pub matched_confirmed: usize,
    pub matched_pending: usize,
    pub created_candidates: usize,
    pub newly_confirmed: usize,
    /// Triangulation attempts that stayed pending.
    pub degenerate: Vec<ObservationError>,
    pub pruned: usize,
    /// Earlier keyframes sharing landmarks with this one, strongest first,
    /// filtered by `min_covisible_landmarks` and capped.
    pub covisible: Vec<(KeyFrameId, usize)>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RestoreError {
    #[error("landmark {0} appears twice")]
    Duplicate(LandmarkId),

    #[error("landmark {landmark} references unknown keyframe {keyframe}")]
    UnknownObserver {
        landmark: LandmarkId,
        keyframe: KeyFrameId,
    },

    #[error("confirmed landmark {0} has no position")]
    MissingPosition(LandmarkId),
}

/// Owns every landmark, pending or confirmed.
pub struct LandmarkTracker {
    config: LandmarkTrackerConfig,
    landmarks: BTreeMap<LandmarkId, Landmark>,
    keyframe_landmarks: HashMap<KeyFrameId, Vec<LandmarkId>>,
    recent_keyframes: VecDeque<KeyFrameId>,
    next_id: u64,
    newest_timestamp_ns: u64,
}

/// Epipolar test from one earlier keyframe into the current one.
enum EpipolarGate {
    /// x2ᵀ E x1 = 0 in normalized coordinates.
    Essential(Matrix3<f64>),
    /// Near-zero baseline: x2 ∝ R x1.
    Rotation(Matrix3<f64>),
}

impl LandmarkTracker {
    pub fn new(config: LandmarkTrackerConfig) -> Self {
        Self {
            config,
            landmarks: BTreeMap::new(),
            keyframe_landmarks: HashMap::new(),
            recent_keyframes: VecDeque::new(),
            next_id: 0,
            newest_timestamp_ns: 0,
        }
    }

    /// Rebuild from persisted landmarks, checking every back-reference.
    pub fn from_parts(
        config: LandmarkTrackerConfig,
        landmarks: Vec<Landmark>,
        graph: &PoseGraph,
    ) -> Result<Self, RestoreError> {
        let mut tracker = Self::new(config);
        for lm in landmarks {
            if tracker.landmarks.contains_key(&lm.id) {
                return Err(RestoreError::Duplicate(lm.id));
            }
            if lm.is_confirmed() && lm.position.is_none() {
                return Err(RestoreError::MissingPosition(lm.id));
            }
            for obs in &lm.observations {
                if graph.keyframe(obs.keyframe_id).is_none() {
                    return Err(RestoreError::UnknownObserver {
                        landmark: lm.id,
                        keyframe: obs.keyframe_id,
                    });
                }
                tracker
                    .keyframe_landmarks
                    .entry(obs.keyframe_id)
                    .or_default()
                    .push(lm.id);
            }
            tracker.next_id = tracker.next_id.max(lm.id.0 + 1);
            tracker.landmarks.insert(lm.id, lm);
        }
        tracker.recent_keyframes = graph
            .recent_ids(tracker.config.working_set_keyframes)
            .into();
        tracker.newest_timestamp_ns = graph.keyframes().map(|kf| kf.timestamp_ns).max().unwrap_or(0);
        Ok(tracker)
    }

    /// Associate the features of `keyframe` (not yet in `graph`) with landmarks.
    pub fn associate(&mut self, keyframe: &KeyFrame, graph: &PoseGraph) -> AssociationReport {
        let mut report = AssociationReport::default();
        self.newest_timestamp_ns = self.newest_timestamp_ns.max(keyframe.timestamp_ns);

        let (confirmed, pending) = self.working_set();
        let mut feature_taken = vec![false; keyframe.features.len()];

        let confirmed_matches = self.match_confirmed(keyframe, &confirmed);
        let confirmed_matches = resolve_conflicts(confirmed_matches, &mut feature_taken);
        let pending_matches = self.match_pending(keyframe, graph, &pending, &feature_taken);
        let pending_matches = resolve_conflicts(pending_matches, &mut feature_taken);

        report.matched_confirmed = confirmed_matches.len();
        report.landmark_matches = confirmed_matches
            .iter()
            .filter_map(|&(lm_id, feature_index)| {
                let position = self.landmarks.get(&lm_id)?.position?;
                Some((position, feature_index))
            })
            .collect();
        report.matched_pending = pending_matches.len();

        let mut touched: Vec<LandmarkId> = Vec::new();
        for (lm_id, feature_index) in confirmed_matches.into_iter().chain(pending_matches) {
            let observation = Observation {
                keyframe_id: keyframe.id,
                feature_index,
            };
            if let Some(lm) = self.landmarks.get_mut(&lm_id) {
                lm.add_observation(
                    observation,
                    keyframe.features[feature_index].descriptor,
                    keyframe.timestamp_ns,
                );
                report.associations.push((lm_id, observation));
                touched.push(lm_id);
            }
        }

        report.covisible = self.covisible_keyframes(keyframe.id, &touched);

        for (feature_index, taken) in feature_taken.iter().enumerate() {
            if *taken {
                continue;
            }
            let id = LandmarkId::new(self.next_id);
            self.next_id += 1;
            let observation = Observation {
                keyframe_id: keyframe.id,
                feature_index,
            };
            self.landmarks.insert(
                id,
                Landmark::candidate(
                    id,
                    observation,
                    keyframe.features[feature_index].descriptor,
                    keyframe.timestamp_ns,
                ),
            );
            report.associations.push((id, observation));
            report.created_candidates += 1;
        }

        self.keyframe_landmarks
            .insert(keyframe.id, report.associations.iter().map(|(id, _)| *id).collect());

        for lm_id in touched {
            self.update_geometry(lm_id, keyframe, graph, &mut report);
        }

        self.recent_keyframes.push_back(keyframe.id);
        while self.recent_keyframes.len() > self.config.working_set_keyframes {
            self.recent_keyframes.pop_front();
        }

        report.pruned = self.prune(self.newest_timestamp_ns);

        debug!(
            keyframe = %keyframe.id,
            features = keyframe.features.len(),
            matched_confirmed = report.matched_confirmed,
            matched_pending = report.matched_pending,
            created = report.created_candidates,
            confirmed = report.newly_confirmed,
            degenerate = report.degenerate.len(),
            pruned = report.pruned,
            "landmark association"
        );
        report
    }

    /// Landmarks seen by the recent keyframes, newest keyframe first,
    /// split into (confirmed, pending).
    fn working_set(&self) -> (Vec<LandmarkId>, Vec<LandmarkId>) {
        let mut seen = HashSet::new();
        let mut confirmed = Vec::new();
        let mut pending = Vec::new();

        'outer: for kf_id in self.recent_keyframes.iter().rev() {
            let Some(ids) = self.keyframe_landmarks.get(kf_id) else {
                continue;
            };
            for id in ids {
                if confirmed.len() + pending.len() >= self.config.max_working_set {
                    break 'outer;
                }
                if !seen.insert(*id) {
                    continue;
                }
                match self.landmarks.get(id) {
                    Some(lm) if lm.is_confirmed() => confirmed.push(*id),
                    Some(_) => pending.push(*id),
                    None => {}
                }
            }
        }
        (confirmed, pending)
    }

    /// Proposals (landmark, feature, distance) for confirmed landmarks.
    fn match_confirmed(
        &self,
        keyframe: &KeyFrame,
        confirmed: &[LandmarkId],
    ) -> Vec<(LandmarkId, usize, u32)> {
        let grid = FeatureGrid::new(
            &keyframe.features,
            keyframe.intrinsics.width,
            keyframe.intrinsics.height,
        );
        let radius = self.config.projection_radius_px;
        let mut proposals = Vec::new();

        for id in confirmed {
            let Some(lm) = self.landmarks.get(id) else {
                continue;
            };
            let Some(position) = lm.position else {
                continue;
            };
            let Some((px, _depth)) = keyframe.project(&position) else {
                continue;
            };
            if !keyframe.intrinsics.in_image(&px) {
                continue;
            }

            let candidates = grid.candidates(px.x, px.y, radius).filter_map(|idx| {
                let f = &keyframe.features[idx];
                let d2 = (f.u - px.x).powi(2) + (f.v - px.y).powi(2);
                (d2 <= radius * radius).then_some((idx, &f.descriptor))
            });
            if let Some(m) = best_match(
                &lm.descriptor,
                candidates,
                self.config.max_descriptor_distance,
                self.config.nn_ratio,
            ) {
                proposals.push((*id, m.index, m.distance));
            }
        }
        proposals
    }

    /// Proposals for pending candidates, gated by epipolar geometry against
    /// the candidate's most recent observation.
    fn match_pending(
        &self,
        keyframe: &KeyFrame,
        graph: &PoseGraph,
        pending: &[LandmarkId],
        feature_taken: &[bool],
    ) -> Vec<(LandmarkId, usize, u32)> {
        let normalized: Vec<Vector3<f64>> = keyframe
            .features
            .iter()
            .map(|f| keyframe.intrinsics.unproject(f.u, f.v))
            .collect();
        let focal = keyframe.intrinsics.mean_focal();
        let threshold = self.config.epipolar_threshold_px / focal;
        let rotation_threshold = self.config.projection_radius_px / focal;

        let mut gates: HashMap<KeyFrameId, EpipolarGate> = HashMap::new();
        let mut proposals = Vec::new();

        for id in pending {
            let Some(lm) = self.landmarks.get(id) else {
                continue;
            };
            let Some(last) = lm.observations.last() else {
                continue;
            };
            if last.keyframe_id == keyframe.id {
                continue;
            }
            let Some(source) = graph.keyframe(last.keyframe_id) else {
                continue;
            };
            let Some(source_feature) = source.features.get(last.feature_index) else {
                continue;
            };
            let x1 = source.intrinsics.unproject(source_feature.u, source_feature.v);
            let gate = &*gates
                .entry(source.id)
                .or_insert_with(|| epipolar_gate(source, keyframe));

            let candidates = normalized.iter().enumerate().filter_map(|(idx, x2)| {
                if feature_taken[idx] {
                    return None;
                }
                let ok = match gate {
                    EpipolarGate::Essential(e) => {
                        let line = *e * x1;
                        let norm = (line.x * line.x + line.y * line.y).sqrt();
                        norm > 1e-12 && (x2.dot(&line)).abs() / norm <= threshold
                    }
                    EpipolarGate::Rotation(r) => {
                        let p = *r * x1;
                        p.z > 1e-9
                            && ((p.x / p.z - x2.x).powi(2) + (p.y / p.z - x2.y).powi(2)).sqrt()
                                <= rotation_threshold
                    }
                };
                ok.then_some((idx, &keyframe.features[idx].descriptor))
            });

            if let Some(m) = best_match(
                &lm.descriptor,
                candidates,
                self.config.max_descriptor_distance,
                self.config.nn_ratio,
            ) {
                proposals.push((*id, m.index, m.distance));
            }
        }
        proposals
    }

    /// Triangulate a candidate that gained a view, or refit a confirmed one.
    fn update_geometry(
        &mut self,
        lm_id: LandmarkId,
        current: &KeyFrame,
        graph: &PoseGraph,
        report: &mut AssociationReport,
    ) {
        let Some(lm) = self.landmarks.get(&lm_id) else {
            return;
        };
        let views = collect_views(lm, current, graph);
        let result = triangulation::triangulate(&views, &self.config.triangulation);
        let was_confirmed = lm.is_confirmed();

        let Some(lm) = self.landmarks.get_mut(&lm_id) else {
            return;
        };
        match (result, was_confirmed) {
            (Ok(position), false) => {
                lm.confirm(position);
                report.newly_confirmed += 1;
            }
            (Ok(position), true) => lm.position = Some(position),
            (Err(failure), false) => {
                lm.failed_triangulations += 1;
                trace!(landmark = %lm_id, %failure, "triangulation deferred");
                report
                    .degenerate
                    .push(ObservationError::DegenerateGeometry(format!("{lm_id}: {failure}")));
            }
            // The refit is discarded; the previous position stays.
            (Err(failure), true) => trace!(landmark = %lm_id, %failure, "refit rejected"),
        }
    }

    fn covisible_keyframes(&self, current: KeyFrameId, touched: &[LandmarkId]) -> Vec<(KeyFrameId, usize)> {
        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for id in touched {
            if let Some(lm) = self.landmarks.get(id) {
                for obs in &lm.observations {
                    if obs.keyframe_id != current {
                        *counts.entry(obs.keyframe_id).or_default() += 1;
                    }
                }
            }
        }

        let mut covisible: Vec<(KeyFrameId, usize)> = counts
            .into_iter()
            .filter(|&(_, n)| n >= self.config.min_covisible_landmarks)
            .collect();
        covisible.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        covisible.truncate(self.config.max_covisibility_constraints);
        covisible
    }

    /// Remove candidates pending longer than the retention window, measured
    /// against sensor time `now_ns`. Returns how many were removed.
    pub fn prune(&mut self, now_ns: u64) -> usize {
        let retention_ns = (self.config.pending_retention_s * 1e9) as u64;
        let stale: Vec<LandmarkId> = self
            .landmarks
            .values()
            .filter(|lm| !lm.is_confirmed() && lm.age_ns(now_ns) > retention_ns)
            .map(|lm| lm.id)
            .collect();

        for id in &stale {
            if let Some(lm) = self.landmarks.remove(id) {
                for obs in &lm.observations {
                    if let Some(ids) = self.keyframe_landmarks.get_mut(&obs.keyframe_id) {
                        ids.retain(|x| x != id);
                    }
                }
            }
        }
        stale.len()
    }

    /// Undo the observations of a keyframe that never made it into the graph.
    pub fn forget_keyframe(&mut self, keyframe_id: KeyFrameId) {
        let ids = self.keyframe_landmarks.remove(&keyframe_id).unwrap_or_default();
        for id in ids {
            let remove = match self.landmarks.get_mut(&id) {
                Some(lm) => {
                    lm.erase_observation(keyframe_id);
                    if lm.is_confirmed() && lm.num_observations() < 2 {
                        lm.position = None;
                        lm.status = LandmarkStatus::Pending;
                    }
                    lm.observations.is_empty()
                }
                None => false,
            };
            if remove {
                self.landmarks.remove(&id);
            }
        }
        self.recent_keyframes.retain(|id| *id != keyframe_id);
    }

    /// Refit every confirmed landmark after keyframe poses changed.
    /// Returns the number of landmarks whose position was updated.
    pub fn retriangulate_all(&mut self, graph: &PoseGraph) -> usize {
        let mut updated = 0;
        let ids: Vec<LandmarkId> = self
            .landmarks
            .values()
            .filter(|lm| lm.is_confirmed())
            .map(|lm| lm.id)
            .collect();

        for id in ids {
            let Some(lm) = self.landmarks.get(&id) else {
                continue;
            };
            let views: Vec<View> = lm
                .observations
                .iter()
                .filter_map(|obs| {
                    graph.keyframe(obs.keyframe_id).map(|kf| View {
                        keyframe: kf,
                        feature_index: obs.feature_index,
                    })
                })
                .collect();
            if let Ok(position) = triangulation::triangulate(&views, &self.config.triangulation) {
                if let Some(lm) = self.landmarks.get_mut(&id) {
                    lm.position = Some(position);
                    updated += 1;
                }
            }
        }
        updated
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    /// All landmarks in id order.
    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn landmarks_of(&self, keyframe_id: KeyFrameId) -> &[LandmarkId] {
        self.keyframe_landmarks
            .get(&keyframe_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn confirmed_count(&self) -> usize {
        self.landmarks.values().filter(|lm| lm.is_confirmed()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.landmarks.len() - self.confirmed_count()
    }

    /// Confirmed landmarks with enough observations to relocalize against.
    pub fn usable_count(&self) -> usize {
        let min = self.config.min_usable_observations;
        self.landmarks.values().filter(|lm| lm.is_usable(min)).count()
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn newest_timestamp_ns(&self) -> u64 {
        self.newest_timestamp_ns
    }

    pub fn config(&self) -> &LandmarkTrackerConfig {
        &self.config
    }
}

impl Default for LandmarkTracker {
    fn default() -> Self {
        Self::new(LandmarkTrackerConfig::default())
    }
}

/// Greedy one-to-one assignment by increasing descriptor distance.
fn resolve_conflicts(
    mut proposals: Vec<(LandmarkId, usize, u32)>,
    feature_taken: &mut [bool],
) -> Vec<(LandmarkId, usize)> {
    proposals.sort_by_key(|&(id, idx, dist)| (dist, idx, id));
    let mut accepted = Vec::new();
    for (id, idx, _) in proposals {
        if !feature_taken[idx] {
            feature_taken[idx] = true;
            accepted.push((id, idx));
        }
    }
    accepted
}

fn epipolar_gate(source: &KeyFrame, target: &KeyFrame) -> EpipolarGate {
    // X_target = R * X_source + t
    let relative = target.pose.inverse().compose(&source.pose);
    let r = relative.rotation.to_rotation_matrix().into_inner();
    let t = relative.translation;
    if t.norm() < 1e-6 {
        EpipolarGate::Rotation(r)
    } else {
        EpipolarGate::Essential(skew(&t) * r)
    }
}

fn collect_views<'a>(lm: &Landmark, current: &'a KeyFrame, graph: &'a PoseGraph) -> Vec<View<'a>> {
    lm.observations
        .iter()
        .filter_map(|obs| {
            let keyframe = if obs.keyframe_id == current.id {
                Some(current)
            } else {
                graph.keyframe(obs.keyframe_id)
            };
            keyframe.map(|keyframe| View {
                keyframe,
                feature_index: obs.feature_index,
            })
        })
        .collect()
}
