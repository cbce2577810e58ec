//! Geo-anchor resolver.
//!
//! Pairs location fixes with the nearest-in-time keyframe, keeps the full
//! correspondence set sorted by fix time, and re-solves the similarity from
//! scratch on every `resolve`. Position samples refine each correspondence's
//! local point by the device motion between keyframe time and fix time.

use std::collections::VecDeque;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::solver::{self, AnchorModel, InsufficientData, SolveLimits, WeightedPair};
use super::GeoAnchorTransform;
use crate::geometry::LocalTangentFrame;
use crate::map::{KeyFrame, KeyFrameId};
use crate::pose_graph::PoseGraph;
use crate::sensors::{LocationFix, PositionSample};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoAnchorConfig {
    pub model: AnchorModel,
    /// Maximum time between a fix or position sample and its keyframe (seconds).
    pub timestamp_tolerance_s: f64,
    /// Minimum horizontal spread of the fixes (metres).
    pub min_separation_m: f64,
    /// Minimum ratio of the second to the first principal extent (Full model).
    pub collinearity_threshold: f64,
    /// Accepted scale band is `[1/(1+d), 1+d]`.
    pub max_scale_deviation: f64,
    /// Floor applied to reported accuracies before weighting (metres).
    pub min_accuracy_m: f64,
    /// Weight multiplier for low-confidence correspondences.
    pub low_confidence_weight: f64,
    /// Fraction of the position-sample motion applied to a correspondence.
    pub position_weight: f64,
    /// Allowed disagreement between position samples and the keyframe centre (metres).
    pub cross_check_tolerance_m: f64,
    pub max_position_samples: usize,
    pub max_pending_fixes: usize,
}

impl Default for GeoAnchorConfig {
    fn default() -> Self {
        Self {
            model: AnchorModel::GravityAligned,
            timestamp_tolerance_s: 2.0,
            min_separation_m: 5.0,
            collinearity_threshold: 0.05,
            max_scale_deviation: 0.5,
            min_accuracy_m: 1.0,
            low_confidence_weight: 0.5,
            position_weight: 1.0,
            cross_check_tolerance_m: 1.0,
            max_position_samples: 512,
            max_pending_fixes: 64,
        }
    }
}

impl GeoAnchorConfig {
    pub fn tolerance_ns(&self) -> u64 {
        (self.timestamp_tolerance_s * 1e9) as u64
    }

    fn limits(&self) -> SolveLimits {
        SolveLimits {
            min_separation_m: self.min_separation_m,
            collinearity_threshold: self.collinearity_threshold,
            max_scale_deviation: self.max_scale_deviation,
        }
    }
}

/// A location fix paired with a keyframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCorrespondence {
    pub keyframe_id: KeyFrameId,
    pub fix: LocationFix,
    /// Fix position in the resolver's ENU frame.
    pub enu: Vector3<f64>,
    /// Fused local-map point: keyframe centre plus `motion_offset`.
    pub local: Vector3<f64>,
    /// Weighted position-sample motion from keyframe time to fix time.
    pub motion_offset: Vector3<f64>,
    pub horizontal_weight: f64,
    pub vertical_weight: f64,
    pub low_confidence: bool,
}

impl GeoCorrespondence {
    fn pair(&self) -> WeightedPair {
        WeightedPair {
            local: self.local,
            enu: self.enu,
            horizontal_weight: self.horizontal_weight,
            vertical_weight: self.vertical_weight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    /// Buffered. `out_of_order` is set when a newer sample was already held.
    Kept { out_of_order: bool },
    /// No keyframe within the timestamp tolerance.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationOutcome {
    Paired(KeyFrameId),
    /// Waiting for a keyframe near its timestamp.
    Pending,
    /// Older than every keyframe it could still pair with.
    Dropped,
}

/// A fix waiting for a keyframe near its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingFix {
    pub fix: LocationFix,
    /// Arrived after a newer fix had been seen.
    #[serde(default)]
    pub out_of_order: bool,
}

/// Pending fixes handled by [`GeoAnchorResolver::retry_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub paired: usize,
    pub dropped: usize,
    /// Paired fixes that were flagged low-confidence.
    pub low_confidence: usize,
}

/// Persistent part of the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoAnchorState {
    pub frame: Option<LocalTangentFrame>,
    pub correspondences: Vec<GeoCorrespondence>,
    pub pending_fixes: Vec<PendingFix>,
    pub position_samples: Vec<PositionSample>,
    pub transform: Option<GeoAnchorTransform>,
}

pub struct GeoAnchorResolver {
    config: GeoAnchorConfig,
    frame: Option<LocalTangentFrame>,
    correspondences: Vec<GeoCorrespondence>,
    pending: VecDeque<PendingFix>,
    positions: VecDeque<PositionSample>,
    transform: Option<GeoAnchorTransform>,
    last_failure: Option<InsufficientData>,
    /// Newest fix timestamp seen, paired or not.
    newest_fix_ns: Option<u64>,
}

impl GeoAnchorResolver {
    pub fn new(config: GeoAnchorConfig) -> Self {
        Self {
            config,
            frame: None,
            correspondences: Vec::new(),
            pending: VecDeque::new(),
            positions: VecDeque::new(),
            transform: None,
            last_failure: None,
            newest_fix_ns: None,
        }
    }

    pub fn from_state(config: GeoAnchorConfig, state: GeoAnchorState) -> Self {
        let mut correspondences = state.correspondences;
        correspondences.sort_by_key(|c| c.fix.timestamp_ns);
        let mut positions: Vec<PositionSample> = state.position_samples;
        positions.sort_by_key(|p| p.timestamp_ns);
        let newest_fix_ns = correspondences
            .iter()
            .map(|c| c.fix.timestamp_ns)
            .chain(state.pending_fixes.iter().map(|p| p.fix.timestamp_ns))
            .max();
        Self {
            config,
            frame: state.frame,
            correspondences,
            pending: state.pending_fixes.into(),
            positions: positions.into(),
            transform: state.transform,
            last_failure: None,
            newest_fix_ns,
        }
    }

    pub fn state(&self) -> GeoAnchorState {
        GeoAnchorState {
            frame: self.frame,
            correspondences: self.correspondences.clone(),
            pending_fixes: self.pending.iter().copied().collect(),
            position_samples: self.positions.iter().copied().collect(),
            transform: self.transform,
        }
    }

    /// Buffer a position sample if some keyframe lies within the tolerance.
    ///
    /// A sample older than the newest buffered one is still kept in time
    /// order and reported as out of order.
    pub fn add_position_sample(&mut self, sample: PositionSample, graph: &PoseGraph) -> PositionOutcome {
        if graph
            .nearest_in_time(sample.timestamp_ns, self.config.tolerance_ns())
            .is_none()
        {
            return PositionOutcome::Discarded;
        }

        let out_of_order = self
            .positions
            .back()
            .is_some_and(|newest| sample.timestamp_ns < newest.timestamp_ns);
        if out_of_order {
            debug!(timestamp_ns = sample.timestamp_ns, "position sample out of order");
        }

        let idx = self
            .positions
            .partition_point(|p| p.timestamp_ns < sample.timestamp_ns);
        match self.positions.get_mut(idx) {
            Some(existing) if existing.timestamp_ns == sample.timestamp_ns => *existing = sample,
            _ => self.positions.insert(idx, sample),
        }
        while self.positions.len() > self.config.max_position_samples {
            self.positions.pop_front();
        }
        PositionOutcome::Kept { out_of_order }
    }

    /// Pair `fix` with the nearest keyframe, or park it until one arrives.
    ///
    /// A fix older than one already seen is accepted and flagged
    /// low-confidence.
    pub fn add_location(&mut self, fix: LocationFix, graph: &PoseGraph) -> LocationOutcome {
        self.frame
            .get_or_insert_with(|| LocalTangentFrame::new(fix.coordinate));
        let out_of_order = self
            .newest_fix_ns
            .is_some_and(|newest| fix.timestamp_ns < newest);
        self.newest_fix_ns = Some(
            self.newest_fix_ns
                .map_or(fix.timestamp_ns, |t| t.max(fix.timestamp_ns)),
        );
        if out_of_order {
            debug!(timestamp_ns = fix.timestamp_ns, "fix arrived out of order");
        }

        if let Some(keyframe) = graph.nearest_in_time(fix.timestamp_ns, self.config.tolerance_ns()) {
            let id = keyframe.id;
            self.insert_correspondence(keyframe, fix, out_of_order);
            return LocationOutcome::Paired(id);
        }
        if self.is_stale(&fix, graph) {
            return LocationOutcome::Dropped;
        }

        self.pending.push_back(PendingFix { fix, out_of_order });
        while self.pending.len() > self.config.max_pending_fixes {
            self.pending.pop_front();
        }
        LocationOutcome::Pending
    }

    /// No future keyframe can land within tolerance of this fix.
    fn is_stale(&self, fix: &LocationFix, graph: &PoseGraph) -> bool {
        graph.last_keyframe().is_some_and(|kf| {
            kf.timestamp_ns > fix.timestamp_ns.saturating_add(self.config.tolerance_ns())
        })
    }

    /// Retry parked fixes after a keyframe insertion.
    pub fn retry_pending(&mut self, graph: &PoseGraph) -> RetryReport {
        let mut report = RetryReport::default();
        let parked: Vec<PendingFix> = self.pending.drain(..).collect();
        for parked_fix in parked {
            let PendingFix { fix, out_of_order } = parked_fix;
            if let Some(keyframe) = graph.nearest_in_time(fix.timestamp_ns, self.config.tolerance_ns()) {
                if self.insert_correspondence(keyframe, fix, out_of_order).low_confidence {
                    report.low_confidence += 1;
                }
                report.paired += 1;
            } else if self.is_stale(&fix, graph) {
                report.dropped += 1;
            } else {
                self.pending.push_back(parked_fix);
            }
        }
        report
    }

    /// Record a (keyframe, fix) correspondence, keeping fix-time order.
    pub fn add_correspondence(&mut self, keyframe: &KeyFrame, fix: LocationFix) -> &GeoCorrespondence {
        self.insert_correspondence(keyframe, fix, false)
    }

    fn insert_correspondence(
        &mut self,
        keyframe: &KeyFrame,
        fix: LocationFix,
        out_of_order: bool,
    ) -> &GeoCorrespondence {
        let frame = *self
            .frame
            .get_or_insert_with(|| LocalTangentFrame::new(fix.coordinate));

        let (motion_offset, contradicted) = self.motion_offset(keyframe, fix.timestamp_ns);
        let low_confidence = contradicted || out_of_order;
        let weight_of = |accuracy: f64| {
            let sigma = accuracy.max(self.config.min_accuracy_m);
            let w = 1.0 / (sigma * sigma);
            if low_confidence {
                w * self.config.low_confidence_weight
            } else {
                w
            }
        };

        let correspondence = GeoCorrespondence {
            keyframe_id: keyframe.id,
            fix,
            enu: frame.to_enu(&fix.coordinate),
            local: keyframe.center() + motion_offset,
            motion_offset,
            horizontal_weight: weight_of(fix.horizontal_accuracy_m),
            vertical_weight: weight_of(fix.vertical_accuracy_m),
            low_confidence,
        };
        debug!(
            keyframe = %keyframe.id,
            fix_ns = fix.timestamp_ns,
            low_confidence,
            "geo correspondence"
        );

        let idx = self
            .correspondences
            .partition_point(|c| c.fix.timestamp_ns <= fix.timestamp_ns);
        self.correspondences.insert(idx, correspondence);
        &self.correspondences[idx]
    }

    /// Position-sample motion between keyframe time and `fix_ns`.
    ///
    /// Returns a zero offset without samples bracketing both times, and a zero
    /// offset flagged low-confidence when the samples contradict the keyframe.
    fn motion_offset(&self, keyframe: &KeyFrame, fix_ns: u64) -> (Vector3<f64>, bool) {
        let (Some(at_keyframe), Some(at_fix)) = (
            self.position_at(keyframe.timestamp_ns),
            self.position_at(fix_ns),
        ) else {
            return (Vector3::zeros(), false);
        };

        if (at_keyframe - keyframe.center()).norm() > self.config.cross_check_tolerance_m {
            return (Vector3::zeros(), true);
        }
        ((at_fix - at_keyframe) * self.config.position_weight, false)
    }

    /// Linear interpolation between the samples bracketing `timestamp_ns`.
    fn position_at(&self, timestamp_ns: u64) -> Option<Vector3<f64>> {
        let idx = self
            .positions
            .partition_point(|p| p.timestamp_ns < timestamp_ns);
        let after = self.positions.get(idx)?;
        if after.timestamp_ns == timestamp_ns {
            return Some(after.position);
        }
        let before = self.positions.get(idx.checked_sub(1)?)?;
        let span = (after.timestamp_ns - before.timestamp_ns) as f64;
        let t = (timestamp_ns - before.timestamp_ns) as f64 / span;
        Some(before.position.lerp(&after.position, t))
    }

    /// Re-derive every local point from the current keyframe poses.
    pub fn refresh_local_points(&mut self, graph: &PoseGraph) {
        for c in &mut self.correspondences {
            if let Some(keyframe) = graph.keyframe(c.keyframe_id) {
                c.local = keyframe.center() + c.motion_offset;
            }
        }
    }

    /// Solve from the whole correspondence set.
    ///
    /// On failure the previously resolved transform, if any, is kept.
    pub fn resolve(&mut self) -> Result<GeoAnchorTransform, InsufficientData> {
        let result = self.solve();
        match &result {
            Ok(transform) => {
                if self.transform.is_none() {
                    info!(
                        correspondences = transform.correspondence_count,
                        scale = transform.scale(),
                        rms_m = transform.rms_error_m,
                        "geo anchor resolved"
                    );
                }
                self.transform = Some(*transform);
                self.last_failure = None;
            }
            Err(failure) => {
                debug!(%failure, "geo anchor unresolved");
                self.last_failure = Some(failure.clone());
            }
        }
        result
    }

    fn solve(&self) -> Result<GeoAnchorTransform, InsufficientData> {
        let Some(frame) = self.frame else {
            return Err(InsufficientData::TooFewCorrespondences {
                found: 0,
                required: self.config.model.min_correspondences(),
            });
        };
        let pairs: Vec<WeightedPair> = self.correspondences.iter().map(GeoCorrespondence::pair).collect();
        let local_to_enu = solver::solve(self.config.model, &pairs, &self.config.limits())?;
        Ok(GeoAnchorTransform {
            local_to_enu,
            frame,
            model: self.config.model,
            rms_error_m: solver::rms_error(&local_to_enu, &pairs),
            correspondence_count: pairs.len(),
        })
    }

    pub fn transform(&self) -> Option<&GeoAnchorTransform> {
        self.transform.as_ref()
    }

    pub fn last_failure(&self) -> Option<&InsufficientData> {
        self.last_failure.as_ref()
    }

    pub fn correspondences(&self) -> &[GeoCorrespondence] {
        &self.correspondences
    }

    pub fn pending_fixes(&self) -> usize {
        self.pending.len()
    }

    pub fn position_sample_count(&self) -> usize {
        self.positions.len()
    }

    pub fn frame(&self) -> Option<&LocalTangentFrame> {
        self.frame.as_ref()
    }

    pub fn config(&self) -> &GeoAnchorConfig {
        &self.config
    }
}

impl Default for GeoAnchorResolver {
    fn default() -> Self {
        Self::new(GeoAnchorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::pose_graph::{Constraint, ConstraintKind};
    use crate::sensors::CameraIntrinsics;
    use crate::simulation::GeoReference;
    use crate::geometry::GeoCoordinate;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    const SECOND: u64 = 1_000_000_000;

    fn keyframe(id: u64, center: Vector3<f64>, timestamp_ns: u64) -> KeyFrame {
        KeyFrame {
            id: KeyFrameId::new(id),
            timestamp_ns,
            pose: SE3::new(UnitQuaternion::identity(), center),
            intrinsics: CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480),
            features: Vec::new(),
            low_confidence: false,
        }
    }

    /// Keyframes at 1 s intervals along the given centres.
    fn graph(centers: &[Vector3<f64>]) -> PoseGraph {
        let mut graph = PoseGraph::new();
        for (i, c) in centers.iter().enumerate() {
            let kf = keyframe(i as u64, *c, i as u64 * SECOND);
            let constraints = graph
                .last_keyframe()
                .map(|prev| vec![Constraint::between(prev, &kf, ConstraintKind::Sequential, 1.0)])
                .unwrap_or_default();
            graph.insert(kf, constraints).unwrap();
        }
        graph
    }

    fn reference() -> GeoReference {
        GeoReference::new(GeoCoordinate::new(47.3769, 8.5417, 408.0), 0.5)
    }

    fn fix(reference: &GeoReference, local: Vector3<f64>, timestamp_ns: u64) -> LocationFix {
        LocationFix::new(timestamp_ns, reference.coordinate_of(&local), 3.0, 5.0)
    }

    fn walk() -> Vec<Vector3<f64>> {
        (0..4).map(|i| Vector3::new(i as f64 * 4.0, 0.0, -(i as f64))).collect()
    }

    #[test]
    fn test_single_fix_is_insufficient() {
        let reference = reference();
        let centers = walk();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::default();

        resolver.add_location(fix(&reference, centers[0], 0), &graph);
        assert!(matches!(
            resolver.resolve(),
            Err(InsufficientData::TooFewCorrespondences { found: 1, .. })
        ));
        assert!(resolver.transform().is_none());
    }

    #[test]
    fn test_resolves_known_transform() {
        let reference = reference();
        let centers = walk();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::default();

        for (i, c) in centers.iter().enumerate() {
            let outcome = resolver.add_location(fix(&reference, *c, i as u64 * SECOND), &graph);
            assert_eq!(outcome, LocationOutcome::Paired(KeyFrameId::new(i as u64)));
        }
        let transform = resolver.resolve().unwrap();

        assert_eq!(transform.correspondence_count, 4);
        assert_relative_eq!(transform.scale(), 1.0, epsilon = 1e-6);
        assert!(transform.rms_error_m < 1e-3);
        let probe = Vector3::new(3.0, 1.0, -7.0);
        let expected = reference.coordinate_of(&probe);
        let got = transform.local_to_geo(&probe);
        assert_relative_eq!(got.latitude_deg, expected.latitude_deg, epsilon = 1e-8);
        assert_relative_eq!(got.longitude_deg, expected.longitude_deg, epsilon = 1e-8);
    }

    #[test]
    fn test_out_of_order_fix_is_sorted_and_recomputed() {
        let reference = reference();
        let centers = walk();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::default();

        resolver.add_location(fix(&reference, centers[3], 3 * SECOND), &graph);
        resolver.add_location(fix(&reference, centers[1], SECOND), &graph);
        let first = resolver.resolve().unwrap();
        assert_eq!(first.correspondence_count, 2);

        resolver.add_location(fix(&reference, centers[0], 0), &graph);
        let second = resolver.resolve().unwrap();
        assert_eq!(second.correspondence_count, 3);

        let times: Vec<u64> = resolver
            .correspondences()
            .iter()
            .map(|c| c.fix.timestamp_ns)
            .collect();
        assert_eq!(times, vec![0, SECOND, 3 * SECOND]);
        let flags: Vec<bool> = resolver
            .correspondences()
            .iter()
            .map(|c| c.low_confidence)
            .collect();
        assert_eq!(flags, vec![true, true, false]);
        let weight = resolver.correspondences()[2].horizontal_weight;
        assert_relative_eq!(resolver.correspondences()[0].horizontal_weight, 0.5 * weight, epsilon = 1e-12);
    }

    #[test]
    fn test_late_pending_fix_pairs_with_low_confidence() {
        let reference = reference();
        let centers = walk();
        let full = graph(&centers);
        let partial = graph(&centers[..2]);
        let mut resolver = GeoAnchorResolver::default();

        resolver.add_location(fix(&reference, centers[1], SECOND), &partial);
        let newer = fix(&reference, centers[3], 4 * SECOND + SECOND / 2);
        let older = fix(&reference, centers[3], 4 * SECOND);
        assert_eq!(resolver.add_location(newer, &partial), LocationOutcome::Pending);
        assert_eq!(resolver.add_location(older, &partial), LocationOutcome::Pending);

        let report = resolver.retry_pending(&full);
        assert_eq!(report.paired, 2);
        assert_eq!(report.low_confidence, 1);
        let flagged: Vec<u64> = resolver
            .correspondences()
            .iter()
            .filter(|c| c.low_confidence)
            .map(|c| c.fix.timestamp_ns)
            .collect();
        assert_eq!(flagged, vec![4 * SECOND]);
    }

    #[test]
    fn test_out_of_order_position_sample_is_kept_in_order() {
        let graph = graph(&walk());
        let mut resolver = GeoAnchorResolver::default();
        let later = PositionSample::new(Vector3::new(1.0, 0.0, 0.0), 2 * SECOND);
        let earlier = PositionSample::new(Vector3::zeros(), SECOND);

        assert_eq!(
            resolver.add_position_sample(later, &graph),
            PositionOutcome::Kept { out_of_order: false }
        );
        assert_eq!(
            resolver.add_position_sample(earlier, &graph),
            PositionOutcome::Kept { out_of_order: true }
        );
        let times: Vec<u64> = resolver.state().position_samples.iter().map(|p| p.timestamp_ns).collect();
        assert_eq!(times, vec![SECOND, 2 * SECOND]);
    }

    #[test]
    fn test_collinear_fixes_fail_with_full_model() {
        let reference = reference();
        let centers: Vec<Vector3<f64>> = (0..4).map(|i| Vector3::new(i as f64 * 4.0, 0.0, 0.0)).collect();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::new(GeoAnchorConfig {
            model: AnchorModel::Full,
            ..GeoAnchorConfig::default()
        });

        for (i, c) in centers.iter().enumerate() {
            resolver.add_location(fix(&reference, *c, i as u64 * SECOND), &graph);
        }
        assert!(matches!(resolver.resolve(), Err(InsufficientData::Collinear { .. })));
        assert!(matches!(resolver.last_failure(), Some(InsufficientData::Collinear { .. })));
    }

    #[test]
    fn test_fix_waits_for_keyframe_then_pairs() {
        let reference = reference();
        let centers = walk();
        let full = graph(&centers);
        let partial = graph(&centers[..2]);
        let mut resolver = GeoAnchorResolver::default();

        let late = fix(&reference, centers[3], 4 * SECOND + SECOND / 2);
        assert_eq!(resolver.add_location(late, &partial), LocationOutcome::Pending);
        assert_eq!(resolver.pending_fixes(), 1);

        let report = resolver.retry_pending(&full);
        assert_eq!(
            report,
            RetryReport {
                paired: 1,
                dropped: 0,
                low_confidence: 0
            }
        );
        assert_eq!(resolver.pending_fixes(), 0);
        assert_eq!(resolver.correspondences()[0].keyframe_id, KeyFrameId::new(3));
    }

    #[test]
    fn test_stale_fix_is_dropped() {
        let reference = reference();
        let mut centers = walk();
        centers.push(Vector3::new(20.0, 0.0, 0.0));
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::new(GeoAnchorConfig {
            timestamp_tolerance_s: 0.2,
            ..GeoAnchorConfig::default()
        });
        // Halfway between keyframes 1 and 2, with keyframes already beyond it.
        let between = fix(&reference, centers[1], SECOND + SECOND / 2);
        assert_eq!(resolver.add_location(between, &graph), LocationOutcome::Dropped);
    }

    #[test]
    fn test_position_samples_shift_local_point() {
        let reference = reference();
        let centers = walk();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::default();

        // Samples agree with keyframe 1 and show 0.5 m of motion 250 ms later.
        let start = centers[1];
        let moved = start + Vector3::new(0.5, 0.0, 0.0);
        assert_eq!(
            resolver.add_position_sample(PositionSample::new(start, SECOND), &graph),
            PositionOutcome::Kept { out_of_order: false }
        );
        resolver.add_position_sample(PositionSample::new(moved, SECOND + SECOND / 2), &graph);

        let c = resolver
            .add_correspondence(graph.keyframe(KeyFrameId::new(1)).unwrap(), fix(&reference, moved, SECOND + SECOND / 4))
            .clone();
        assert!(!c.low_confidence);
        assert_relative_eq!(c.local, start + Vector3::new(0.25, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_contradicting_samples_flag_low_confidence() {
        let reference = reference();
        let centers = walk();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::default();

        let off = centers[1] + Vector3::new(5.0, 0.0, 0.0);
        resolver.add_position_sample(PositionSample::new(off, SECOND), &graph);
        resolver.add_position_sample(PositionSample::new(off, 2 * SECOND), &graph);

        let c = resolver
            .add_correspondence(graph.keyframe(KeyFrameId::new(1)).unwrap(), fix(&reference, centers[1], SECOND))
            .clone();
        assert!(c.low_confidence);
        assert_eq!(c.local, centers[1]);
        assert_relative_eq!(c.horizontal_weight, 0.5 / 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_position_far_from_keyframes_is_discarded() {
        let graph = graph(&walk());
        let mut resolver = GeoAnchorResolver::default();
        let sample = PositionSample::new(Vector3::zeros(), 60 * SECOND);
        assert_eq!(resolver.add_position_sample(sample, &graph), PositionOutcome::Discarded);
        assert_eq!(resolver.position_sample_count(), 0);
    }

    #[test]
    fn test_state_round_trip_keeps_transform() {
        let reference = reference();
        let centers = walk();
        let graph = graph(&centers);
        let mut resolver = GeoAnchorResolver::default();
        for (i, c) in centers.iter().enumerate() {
            resolver.add_location(fix(&reference, *c, i as u64 * SECOND), &graph);
        }
        resolver.resolve().unwrap();

        let json = serde_json::to_string(&resolver.state()).unwrap();
        let state: GeoAnchorState = serde_json::from_str(&json).unwrap();
        let restored = GeoAnchorResolver::from_state(GeoAnchorConfig::default(), state);
        assert_eq!(restored.correspondences().len(), 4);
        assert!(restored.transform().is_some());
    }
}
