//! Mapping session bound to one directory.
//!
//! The `Mapper` is the entry point callers interact with. It owns the
//! directory lock for its whole lifetime and routes every observation through
//! the session pipeline:
//!
//! frame -> keyframe selector -> landmark tracker -> pose graph
//! position / location -> geo-anchor resolver
//! write_metadata -> full refinement -> map store
//!
//! All methods take `&self`, so one `Mapper` can be shared between the
//! threads delivering frames and locations.

use std::path::Path;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::session::{FixOutcome, FrameOutcome, SampleOutcome, SessionPhase, SessionState, SessionStats};
use crate::config::MapperConfig;
use crate::error::Result;
use crate::geo_anchor::{GeoAnchorTransform, InsufficientData};
use crate::io::{export_csv, ExportSummary, MapMetadata, MapStore};
use crate::sensors::{FrameObservation, GeolocationFix};

pub struct Mapper {
    store: MapStore,
    state: Mutex<SessionState>,
    /// Serializes `write_metadata`; held across the file writes.
    flush_lock: Mutex<()>,
}

impl Mapper {
    /// Bind `directory` with the default configuration.
    pub fn bind(directory: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_config(directory, MapperConfig::default())
    }

    /// Bind `directory`, continuing the stored map if one exists.
    ///
    /// Fails with `OwnershipConflict` when another session holds the
    /// directory, and with a storage error when the stored map is unreadable.
    pub fn bind_with_config(directory: impl AsRef<Path>, config: MapperConfig) -> Result<Self> {
        let store = MapStore::bind(directory.as_ref(), config.store.clone())?;
        let state = match store.load(&config)? {
            Some(restored) => SessionState::restore(restored, config),
            None => SessionState::new(config),
        };
        info!(
            directory = %store.directory().display(),
            session = %state.identity.session_id,
            keyframes = state.graph.len(),
            "session bound"
        );
        Ok(Self {
            store,
            state: Mutex::new(state),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn add_frame<F: FrameObservation + ?Sized>(&self, frame: &F) -> FrameOutcome {
        self.state.lock().add_frame(frame)
    }

    /// Add a device position in the position supplier's frame.
    pub fn add_position(&self, position: Vector3<f64>, timestamp_ns: u64) -> SampleOutcome {
        self.state.lock().add_position(position, timestamp_ns)
    }

    pub fn add_location<L: GeolocationFix + ?Sized>(&self, fix: &L) -> FixOutcome {
        self.state.lock().add_location(fix)
    }

    /// Refine, snapshot and durably write the session.
    ///
    /// Refinement and snapshotting hold the session lock; the file writes do
    /// not, so observations keep flowing during the save. On failure the
    /// previously committed map stays on disk.
    pub fn write_metadata(&self) -> Result<MapMetadata> {
        let _flush = self.flush_lock.lock();
        let (snapshot, revision) = {
            let mut state = self.state.lock();
            let snapshot = state.prepare_snapshot();
            (snapshot, state.revision)
        };

        let metadata = self.store.save(snapshot)?;

        let mut state = self.state.lock();
        state.stats.saves += 1;
        if state.revision == revision {
            state.phase = SessionPhase::Flushed;
        }
        Ok(metadata)
    }

    /// Release the directory. Unflushed changes are discarded.
    pub fn close(self) {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Active {
            warn!(
                directory = %self.store.directory().display(),
                "closing session with unsaved changes"
            );
        }
        state.phase = SessionPhase::Closed;
        info!(directory = %self.store.directory().display(), "session closed");
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn keyframe_count(&self) -> usize {
        self.state.lock().graph.len()
    }

    /// Confirmed landmarks.
    pub fn landmark_count(&self) -> usize {
        self.state.lock().tracker.confirmed_count()
    }

    pub fn pending_landmark_count(&self) -> usize {
        self.state.lock().tracker.pending_count()
    }

    pub fn correspondence_count(&self) -> usize {
        self.state.lock().resolver.correspondences().len()
    }

    /// Most recently resolved anchor, if any.
    pub fn geo_anchor(&self) -> Option<GeoAnchorTransform> {
        self.state.lock().resolver.transform().copied()
    }

    /// Re-solve from every correspondence collected so far.
    pub fn resolve_geo_anchor(&self) -> std::result::Result<GeoAnchorTransform, InsufficientData> {
        self.state.lock().resolve_anchor()
    }

    pub fn stats(&self) -> SessionStats {
        self.state.lock().stats
    }

    pub fn session_id(&self) -> String {
        self.state.lock().identity.session_id.clone()
    }

    pub fn directory(&self) -> &Path {
        self.store.directory()
    }

    /// Write the in-memory trajectory and landmarks as CSV.
    pub fn export_csv(&self, out_dir: impl AsRef<Path>) -> Result<ExportSummary> {
        let state = self.state.lock();
        Ok(export_csv(
            &state.graph,
            &state.tracker,
            state.resolver.transform(),
            out_dir.as_ref(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MapperError, ObservationError, StorageError};
    use crate::geometry::{GeoCoordinate, SE3};
    use crate::sensors::LocationFix;
    use crate::simulation::{
        straight_walk, ScenarioConfig, SensorEvent, SyntheticScenario, SyntheticWorld, WorldConfig,
    };
    use crate::pose_graph::ConstraintKind;
    use nalgebra::UnitQuaternion;
    use std::sync::Arc;

    const SECOND: u64 = 1_000_000_000;

    fn walk_frames(mapper: &Mapper, n: usize) {
        let mut world = SyntheticWorld::new(WorldConfig::default());
        for (pose, ts) in straight_walk(n, 0.5, SECOND, SECOND / 2) {
            let outcome = mapper.add_frame(&world.render(pose, ts));
            assert!(matches!(outcome, FrameOutcome::Inserted { .. }), "{outcome:?}");
        }
    }

    fn run_scenario(mapper: &Mapper, scenario: &mut SyntheticScenario) {
        for event in scenario.events() {
            match event {
                SensorEvent::Frame(frame) => {
                    mapper.add_frame(&frame);
                }
                SensorEvent::Position(sample) => {
                    mapper.add_position(sample.position, sample.timestamp_ns);
                }
                SensorEvent::Location(fix) => {
                    mapper.add_location(&fix);
                }
            }
        }
    }

    #[test]
    fn test_flush_and_rebind_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        assert_eq!(mapper.phase(), SessionPhase::Created);

        walk_frames(&mapper, 5);
        assert_eq!(mapper.phase(), SessionPhase::Active);
        let metadata = mapper.write_metadata().unwrap();
        assert_eq!(mapper.phase(), SessionPhase::Flushed);
        assert_eq!(metadata.keyframe_count, 5);
        assert!(metadata.landmark_count > 0);
        assert!(!metadata.has_geo_anchor);

        let landmarks = mapper.landmark_count();
        let pending = mapper.pending_landmark_count();
        let session = mapper.session_id();
        mapper.close();

        let reopened = Mapper::bind(dir.path()).unwrap();
        assert_eq!(reopened.keyframe_count(), 5);
        assert_eq!(reopened.landmark_count(), landmarks);
        assert_eq!(reopened.pending_landmark_count(), pending);
        assert_eq!(reopened.session_id(), session);
        assert!(reopened.geo_anchor().is_none());
    }

    #[test]
    fn test_second_bind_is_an_ownership_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Mapper::bind(dir.path()).unwrap();
        assert!(matches!(
            Mapper::bind(dir.path()),
            Err(MapperError::OwnershipConflict { .. })
        ));
    }

    #[test]
    fn test_unreadable_map_fails_bind_and_releases_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CURRENT"), "not a generation").unwrap();
        assert!(matches!(
            Mapper::bind(dir.path()),
            Err(MapperError::Storage(StorageError::Corrupt { .. }))
        ));
        assert!(!dir.path().join("LOCK").exists());
    }

    #[test]
    fn test_bad_inputs_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        walk_frames(&mapper, 2);

        let mut world = SyntheticWorld::new(WorldConfig::default());
        let mut frame = world.render(SE3::identity(), 3 * SECOND);
        frame.pose.translation.x = f64::NAN;
        assert!(matches!(
            mapper.add_frame(&frame),
            FrameOutcome::Dropped(ObservationError::TransientInput(_))
        ));

        let bad_fix = LocationFix::new(SECOND, GeoCoordinate::new(123.0, 8.0, 0.0), 3.0, 3.0);
        assert!(matches!(mapper.add_location(&bad_fix), FixOutcome::Dropped(_)));
        assert!(matches!(
            mapper.add_position(Vector3::new(f64::INFINITY, 0.0, 0.0), SECOND),
            SampleOutcome::Dropped(_)
        ));

        let stats = mapper.stats();
        assert_eq!(stats.transient_drops, 3);
        assert_eq!(mapper.keyframe_count(), 2);
    }

    #[test]
    fn test_close_frames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        let mut world = SyntheticWorld::new(WorldConfig::default());

        mapper.add_frame(&world.render(SE3::identity(), SECOND));
        let nudge = SE3::new(UnitQuaternion::identity(), Vector3::new(0.05, 0.0, 0.0));
        assert_eq!(mapper.add_frame(&world.render(nudge, SECOND + SECOND / 10)), FrameOutcome::Rejected);

        let stats = mapper.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_accepted, 1);
        assert_eq!(stats.frames_rejected, 1);
    }

    #[test]
    fn test_out_of_order_frame_is_kept_with_low_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        walk_frames(&mapper, 3);

        let mut world = SyntheticWorld::new(WorldConfig::default());
        let earlier = SE3::new(UnitQuaternion::identity(), Vector3::new(3.0, 0.0, 0.0));
        let outcome = mapper.add_frame(&world.render(earlier, SECOND / 4));
        assert!(matches!(outcome, FrameOutcome::Inserted { .. }));
        assert_eq!(mapper.stats().low_confidence_inputs, 1);
    }

    #[test]
    fn test_graph_stays_connected_across_mixed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        walk_frames(&mapper, 4);

        let mut world = SyntheticWorld::new(WorldConfig::default());
        let late = SE3::new(UnitQuaternion::identity(), Vector3::new(2.0, 0.0, 0.0));
        let outcome = mapper.add_frame(&world.render(late, 2 * SECOND + SECOND / 4));
        assert!(matches!(outcome, FrameOutcome::Inserted { .. }), "{outcome:?}");

        let nudge = SE3::new(UnitQuaternion::identity(), Vector3::new(2.05, 0.0, 0.0));
        assert_eq!(
            mapper.add_frame(&world.render(nudge, 2 * SECOND + 6 * SECOND / 10)),
            FrameOutcome::Rejected
        );

        for (pose, ts) in straight_walk(4, 0.5, 3 * SECOND, SECOND / 2) {
            let pose = SE3::new(pose.rotation, pose.translation + Vector3::new(2.5, 0.0, 0.0));
            let outcome = mapper.add_frame(&world.render(pose, ts));
            assert!(matches!(outcome, FrameOutcome::Inserted { .. }), "{outcome:?}");
        }

        let stats = mapper.stats();
        assert_eq!(stats.frames_accepted, 9);
        assert_eq!(stats.frames_rejected, 1);
        assert_eq!(stats.low_confidence_inputs, 1);
        let state = mapper.state.lock();
        assert_eq!(state.graph.len(), 9);
        assert!(state.graph.is_connected());
    }

    #[test]
    fn test_full_refinement_reconciles_drifting_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MapperConfig::default();
        config.pose_graph.local_window = 2;
        let mapper = Mapper::bind_with_config(dir.path(), config).unwrap();

        // The tracker slowly sags and turns away from where the points say
        // the camera is.
        let mut world = SyntheticWorld::new(WorldConfig::default());
        for (k, (truth, ts)) in straight_walk(8, 0.5, SECOND, SECOND / 2).into_iter().enumerate() {
            let k = k as f64;
            let drift = SE3::new(
                UnitQuaternion::from_euler_angles(0.0, (0.1 * k).to_radians(), 0.0),
                Vector3::new(0.0, 0.002 * k * k, 0.0),
            );
            let mut frame = world.render(truth, ts);
            frame.pose = drift.compose(&truth);
            let outcome = mapper.add_frame(&frame);
            assert!(matches!(outcome, FrameOutcome::Inserted { .. }), "{outcome:?}");
        }

        let (before, poses) = {
            let state = mapper.state.lock();
            assert!(state
                .graph
                .constraints()
                .iter()
                .any(|c| c.kind == ConstraintKind::Covisibility));
            let poses: Vec<_> = state.graph.keyframes().map(|kf| (kf.id, kf.pose)).collect();
            (state.graph.total_error(), poses)
        };
        assert!(before > 0.0);

        mapper.write_metadata().unwrap();

        let state = mapper.state.lock();
        let after = state.graph.total_error();
        assert!(after < before, "{after} >= {before}");
        let moved = poses
            .iter()
            .filter_map(|(id, pose)| Some(state.graph.keyframe(*id)?.pose.translation_distance(pose)))
            .fold(0.0, f64::max);
        assert!(moved > 1e-6);
        assert_eq!(state.stats.full_refinements, 1);
    }

    #[test]
    fn test_failed_save_keeps_session_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        walk_frames(&mapper, 5);
        let keyframes = mapper.keyframe_count();
        let landmarks = mapper.landmark_count();
        let pending = mapper.pending_landmark_count();

        std::fs::create_dir(dir.path().join(format!("{}.tmp", crate::io::format::CURRENT_FILE))).unwrap();
        assert!(mapper.write_metadata().is_err());

        assert_eq!(mapper.keyframe_count(), keyframes);
        assert_eq!(mapper.landmark_count(), landmarks);
        assert_eq!(mapper.pending_landmark_count(), pending);
        assert_eq!(mapper.phase(), SessionPhase::Active);
        assert_eq!(mapper.stats().saves, 0);
    }

    #[test]
    fn test_synthetic_session_resolves_geo_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        let mut scenario = SyntheticScenario::new(ScenarioConfig::default());
        run_scenario(&mapper, &mut scenario);

        let stats = mapper.stats();
        assert_eq!(stats.frames_accepted, 24);
        assert_eq!(stats.fixes_paired, 8);
        assert!(stats.positions_kept > 0);

        let anchor = mapper.geo_anchor().expect("anchor resolved");
        assert_eq!(anchor.correspondence_count, 8);
        assert!(anchor.rms_error_m < 0.1, "rms {}", anchor.rms_error_m);

        let reference = scenario.reference();
        let point = Vector3::new(4.0, 1.0, -3.0);
        let expected = reference.frame.to_enu(&reference.coordinate_of(&point));
        let got = reference.frame.to_enu(&anchor.local_to_geo(&point));
        assert!((expected - got).norm() < 0.1, "{expected} vs {got}");

        let metadata = mapper.write_metadata().unwrap();
        assert!(metadata.has_geo_anchor);
        assert_eq!(metadata.correspondence_count, 8);
    }

    #[test]
    fn test_out_of_order_fix_is_absorbed_and_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        let config = ScenarioConfig {
            fix_every: 0,
            ..ScenarioConfig::default()
        };
        let mut scenario = SyntheticScenario::new(config);
        run_scenario(&mapper, &mut scenario);

        let late = scenario.fix_at(20.0);
        let early = scenario.fix_at(2.0);
        let middle = scenario.fix_at(10.0);
        let flagged = |mapper: &Mapper| -> Vec<u64> {
            let state = mapper.state.lock();
            let mut ts: Vec<u64> = state
                .resolver
                .correspondences()
                .iter()
                .filter(|c| c.low_confidence)
                .map(|c| c.fix.timestamp_ns)
                .collect();
            ts.sort_unstable();
            ts
        };
        let baseline = mapper.stats().low_confidence_inputs;

        assert!(matches!(mapper.add_location(&late), FixOutcome::Paired(_)));
        assert!(flagged(&mapper).is_empty());
        assert!(matches!(mapper.add_location(&early), FixOutcome::Paired(_)));
        assert_eq!(flagged(&mapper), vec![early.timestamp_ns]);
        assert_eq!(mapper.stats().low_confidence_inputs, baseline + 1);
        let first = mapper.resolve_geo_anchor().unwrap();
        assert_eq!(first.correspondence_count, 2);

        // Still older than the newest fix seen.
        assert!(matches!(mapper.add_location(&middle), FixOutcome::Paired(_)));
        assert_eq!(flagged(&mapper), vec![early.timestamp_ns, middle.timestamp_ns]);
        assert_eq!(mapper.stats().low_confidence_inputs, baseline + 2);
        let second = mapper.resolve_geo_anchor().unwrap();
        assert_eq!(second.correspondence_count, 3);
    }

    #[test]
    fn test_out_of_order_position_sample_is_low_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Mapper::bind(dir.path()).unwrap();
        walk_frames(&mapper, 3);

        assert_eq!(
            mapper.add_position(Vector3::new(0.5, 0.0, 0.0), 3 * SECOND / 2),
            SampleOutcome::Kept { low_confidence: false }
        );
        assert_eq!(
            mapper.add_position(Vector3::new(0.0, 0.0, 0.0), SECOND),
            SampleOutcome::Kept { low_confidence: true }
        );
        let stats = mapper.stats();
        assert_eq!(stats.positions_kept, 2);
        assert_eq!(stats.low_confidence_inputs, 1);
    }

    #[test]
    fn test_observations_continue_while_flushing() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = Arc::new(Mapper::bind(dir.path()).unwrap());
        walk_frames(&mapper, 2);

        std::thread::scope(|s| {
            let writer = Arc::clone(&mapper);
            s.spawn(move || {
                for _ in 0..3 {
                    writer.write_metadata().unwrap();
                }
            });
            let mut world = SyntheticWorld::new(WorldConfig::default());
            for (pose, ts) in straight_walk(6, 0.5, 10 * SECOND, SECOND / 2) {
                let pose = SE3::new(pose.rotation, pose.translation + Vector3::new(1.0, 0.0, 0.0));
                mapper.add_frame(&world.render(pose, ts));
            }
        });

        let metadata = mapper.write_metadata().unwrap();
        assert_eq!(metadata.keyframe_count, mapper.keyframe_count());
        assert_eq!(mapper.stats().saves, 4);
        assert_eq!(mapper.phase(), SessionPhase::Flushed);
    }
}
