//! Mutable state of one mapping session and the per-observation pipeline.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MapperConfig;
use crate::error::ObservationError;
use crate::geometry::SE3;
use crate::geo_anchor::{
    GeoAnchorResolver, GeoAnchorTransform, InsufficientData, LocationOutcome, PositionOutcome,
};
use crate::io::{MapSnapshot, RestoredMap, SessionIdentity};
use crate::landmarks::{AssociationReport, LandmarkTracker};
use crate::map::{KeyFrame, KeyFrameId};
use crate::pose_graph::{Constraint, ConstraintKind, PoseGraph};
use crate::sensors::{
    validate_fix, validate_frame, FrameObservation, GeolocationFix, LocationFix, PositionSample,
};
use crate::tracking::{
    estimate_pose, AcceptReason, KeyframeSelector, PoseCorrespondence, PoseEstimate, Selection,
};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Bound, nothing added since bind or load.
    Created,
    /// Holds changes not yet written.
    Active,
    /// Everything in memory is on disk.
    Flushed,
    Closed,
}

/// Counters for absorbed errors and pipeline decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_received: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub transient_drops: u64,
    pub degenerate_events: u64,
    pub low_confidence_inputs: u64,
    pub positions_kept: u64,
    pub positions_discarded: u64,
    pub fixes_paired: u64,
    pub fixes_pending: u64,
    pub fixes_dropped: u64,
    pub local_refinements: u64,
    pub full_refinements: u64,
    pub saves: u64,
}

/// What `add_frame` did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Inserted {
        keyframe: KeyFrameId,
        reason: AcceptReason,
        matched: usize,
        created: usize,
        confirmed: usize,
    },
    /// Too close to the last keyframe.
    Rejected,
    Dropped(ObservationError),
}

/// What `add_position` did with a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Buffered; `low_confidence` when it arrived after a newer sample.
    Kept { low_confidence: bool },
    /// No keyframe within the timestamp tolerance.
    Discarded,
    Dropped(ObservationError),
}

/// What `add_location` did with a fix.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    Paired(KeyFrameId),
    Pending,
    /// No keyframe can pair with it anymore.
    Stale,
    Dropped(ObservationError),
}

pub(crate) struct SessionState {
    pub identity: SessionIdentity,
    pub config: MapperConfig,
    pub phase: SessionPhase,
    pub selector: KeyframeSelector,
    pub graph: PoseGraph,
    pub tracker: LandmarkTracker,
    pub resolver: GeoAnchorResolver,
    pub stats: SessionStats,
    /// Bumped by every mutation; a flush only marks the session flushed if
    /// nothing changed while it was writing.
    pub revision: u64,
    /// Pose the newest keyframe arrived with, before any refinement.
    last_tracked: Option<(KeyFrameId, SE3)>,
}

impl SessionState {
    pub fn new(config: MapperConfig) -> Self {
        Self {
            identity: SessionIdentity::generate(),
            selector: KeyframeSelector::new(config.keyframe_selector.clone()),
            graph: PoseGraph::new(),
            tracker: LandmarkTracker::new(config.landmarks.clone()),
            resolver: GeoAnchorResolver::new(config.geo_anchor.clone()),
            config,
            phase: SessionPhase::Created,
            stats: SessionStats::default(),
            revision: 0,
            last_tracked: None,
        }
    }

    /// Continue a stored session. Components were rebuilt with `config`.
    pub fn restore(restored: RestoredMap, config: MapperConfig) -> Self {
        Self {
            identity: restored.metadata.identity(),
            selector: KeyframeSelector::new(config.keyframe_selector.clone()),
            graph: restored.graph,
            tracker: restored.tracker,
            resolver: restored.resolver,
            config,
            phase: SessionPhase::Created,
            stats: SessionStats {
                low_confidence_inputs: restored.metadata.low_confidence_inputs,
                ..SessionStats::default()
            },
            revision: 0,
            last_tracked: None,
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.phase = SessionPhase::Active;
    }

    pub fn add_frame<F: FrameObservation + ?Sized>(&mut self, frame: &F) -> FrameOutcome {
        self.stats.frames_received += 1;
        if let Err(e) = validate_frame(frame) {
            warn!(timestamp_ns = frame.timestamp_ns(), error = %e, "frame dropped");
            self.stats.transient_drops += 1;
            return FrameOutcome::Dropped(e);
        }

        let timestamp_ns = frame.timestamp_ns();
        let last = self.graph.last_keyframe();
        let out_of_order = last.is_some_and(|kf| timestamp_ns < kf.timestamp_ns);
        let tracked = frame.pose();
        let seeded = last.map_or(tracked, |prev| {
            prev.pose.compose(&self.tracked_motion(prev, &tracked))
        });
        let reason = match self.selector.select(&seeded, timestamp_ns, last) {
            Selection::Accept(reason) => reason,
            Selection::Reject => {
                self.stats.frames_rejected += 1;
                return FrameOutcome::Rejected;
            }
        };

        let id = self.graph.next_keyframe_id();
        let mut keyframe = KeyFrame::from_observation(id, frame, out_of_order);
        keyframe.pose = seeded;
        let report = self.tracker.associate(&keyframe, &self.graph);
        let estimate = self.locate_against_landmarks(&keyframe, &report);
        let located = estimate.as_ref().and_then(|e| e.as_ref().ok());
        let constraints = self.constraints_for(&keyframe, &report, located);

        if let Err(e) = self.graph.insert(keyframe, constraints) {
            self.tracker.forget_keyframe(id);
            warn!(keyframe = %id, error = %e, "keyframe insertion failed");
            self.stats.transient_drops += 1;
            return FrameOutcome::Dropped(ObservationError::TransientInput(e.to_string()));
        }
        self.touch();
        self.last_tracked = Some((id, tracked));
        self.stats.frames_accepted += 1;
        if out_of_order {
            warn!(keyframe = %id, timestamp_ns, "frame older than the previous keyframe");
            self.stats.low_confidence_inputs += 1;
        }
        if !report.degenerate.is_empty() {
            debug!(keyframe = %id, count = report.degenerate.len(), "triangulations deferred");
            self.stats.degenerate_events += report.degenerate.len() as u64;
        }
        if let Some(Err(e)) = &estimate {
            debug!(keyframe = %id, error = %e, "no landmark-based pose");
            self.stats.degenerate_events += 1;
        }

        let refine = self.graph.refine_local(&self.config.pose_graph);
        if refine.optimized > 0 {
            self.stats.local_refinements += 1;
        }

        let retry = self.resolver.retry_pending(&self.graph);
        self.stats.fixes_paired += retry.paired as u64;
        self.stats.fixes_dropped += retry.dropped as u64;
        self.stats.low_confidence_inputs += retry.low_confidence as u64;
        if retry.paired > 0 {
            self.resolve_anchor().ok();
        }

        FrameOutcome::Inserted {
            keyframe: id,
            reason,
            matched: report.matched_confirmed + report.matched_pending,
            created: report.created_candidates,
            confirmed: report.newly_confirmed,
        }
    }

    /// Motion the tracker reported since `prev`. After a reload the tracked
    /// pose of `prev` is gone and its stored pose stands in.
    fn tracked_motion(&self, prev: &KeyFrame, tracked: &SE3) -> SE3 {
        let base = match self.last_tracked {
            Some((id, pose)) if id == prev.id => pose,
            _ => prev.pose,
        };
        base.between(tracked)
    }

    /// Pose of `keyframe` implied by the confirmed landmarks it matched.
    /// `None` when it matched none.
    fn locate_against_landmarks(
        &self,
        keyframe: &KeyFrame,
        report: &AssociationReport,
    ) -> Option<Result<PoseEstimate, ObservationError>> {
        if report.landmark_matches.is_empty() {
            return None;
        }
        let correspondences: Vec<PoseCorrespondence> = report
            .landmark_matches
            .iter()
            .filter_map(|&(point, feature_index)| {
                let f = keyframe.features.get(feature_index)?;
                Some(PoseCorrespondence {
                    point,
                    pixel: Vector2::new(f.u, f.v),
                })
            })
            .collect();
        Some(estimate_pose(
            &keyframe.pose,
            &keyframe.intrinsics,
            &correspondences,
            &self.config.pose_estimation,
        ))
    }

    /// Sequential constraint from the tracked motion since the previous
    /// keyframe, plus covisibility constraints measured from the
    /// landmark-based pose. Without that pose there are no covisibility
    /// constraints.
    fn constraints_for(
        &self,
        keyframe: &KeyFrame,
        report: &AssociationReport,
        estimate: Option<&PoseEstimate>,
    ) -> Vec<Constraint> {
        let cfg = &self.config.pose_graph;
        let mut constraints = Vec::new();
        if let Some(prev) = self.graph.last_keyframe() {
            constraints.push(Constraint::between(
                prev,
                keyframe,
                ConstraintKind::Sequential,
                cfg.sequential_information,
            ));
        }

        let Some(estimate) = estimate else {
            return constraints;
        };
        for &(other, shared) in &report.covisible {
            if let Some(other) = self.graph.keyframe(other) {
                constraints.push(Constraint {
                    from: other.id,
                    to: keyframe.id,
                    measurement: other.pose.between(&estimate.pose),
                    information: cfg.covisibility_information_per_landmark * shared as f64,
                    kind: ConstraintKind::Covisibility,
                });
            }
        }
        constraints
    }

    pub fn add_position(&mut self, position: Vector3<f64>, timestamp_ns: u64) -> SampleOutcome {
        if !position.iter().all(|v| v.is_finite()) {
            self.stats.transient_drops += 1;
            let e = ObservationError::TransientInput("position is not finite".into());
            warn!(timestamp_ns, error = %e, "position dropped");
            return SampleOutcome::Dropped(e);
        }

        match self
            .resolver
            .add_position_sample(PositionSample::new(position, timestamp_ns), &self.graph)
        {
            PositionOutcome::Kept { out_of_order } => {
                self.touch();
                self.stats.positions_kept += 1;
                if out_of_order {
                    self.stats.low_confidence_inputs += 1;
                }
                SampleOutcome::Kept {
                    low_confidence: out_of_order,
                }
            }
            PositionOutcome::Discarded => {
                self.stats.positions_discarded += 1;
                SampleOutcome::Discarded
            }
        }
    }

    pub fn add_location<L: GeolocationFix + ?Sized>(&mut self, fix: &L) -> FixOutcome {
        if let Err(e) = validate_fix(fix) {
            warn!(timestamp_ns = fix.timestamp_ns(), error = %e, "location dropped");
            self.stats.transient_drops += 1;
            return FixOutcome::Dropped(e);
        }
        let fix = LocationFix::from_fix(fix);
        self.touch();

        match self.resolver.add_location(fix, &self.graph) {
            LocationOutcome::Paired(keyframe) => {
                self.stats.fixes_paired += 1;
                let low_confidence = self
                    .resolver
                    .correspondences()
                    .iter()
                    .any(|c| c.fix == fix && c.low_confidence);
                if low_confidence {
                    self.stats.low_confidence_inputs += 1;
                }
                self.resolve_anchor().ok();
                FixOutcome::Paired(keyframe)
            }
            LocationOutcome::Pending => {
                self.stats.fixes_pending += 1;
                FixOutcome::Pending
            }
            LocationOutcome::Dropped => {
                self.stats.fixes_dropped += 1;
                FixOutcome::Stale
            }
        }
    }

    /// Re-solve the anchor from the full correspondence set.
    pub fn resolve_anchor(&mut self) -> Result<GeoAnchorTransform, InsufficientData> {
        self.resolver.refresh_local_points(&self.graph);
        let result = self.resolver.resolve();
        if let Err(failure) = &result {
            if !matches!(failure, InsufficientData::TooFewCorrespondences { .. }) {
                self.stats.degenerate_events += 1;
            }
        }
        result
    }

    /// Full refinement and re-solve ahead of a save, then copy everything out.
    ///
    /// The refined poses and the re-solved anchor stay in memory even if the
    /// save then fails. Landmark and pending counts are untouched here.
    pub fn prepare_snapshot(&mut self) -> MapSnapshot {
        let refine = self.graph.refine_full(&self.config.pose_graph);
        if refine.optimized > 0 {
            self.stats.full_refinements += 1;
            let moved = self.tracker.retriangulate_all(&self.graph);
            debug!(keyframes = refine.optimized, landmarks = moved, "refined before save");
        }
        if !self.resolver.correspondences().is_empty() {
            self.resolve_anchor().ok();
        }

        MapSnapshot::capture(
            &self.identity,
            self.stats.low_confidence_inputs,
            &self.graph,
            &self.tracker,
            &self.resolver,
            &self.config,
        )
    }
}
