//! CSV export of the trajectory and the confirmed landmarks.

use std::fs;
use std::path::{Path, PathBuf};

use csv::Writer;
use serde::Serialize;

use crate::error::StorageError;
use crate::geo_anchor::GeoAnchorTransform;
use crate::landmarks::LandmarkTracker;
use crate::pose_graph::PoseGraph;

pub const TRAJECTORY_CSV: &str = "trajectory.csv";
pub const LANDMARKS_CSV: &str = "landmarks.csv";

#[derive(Debug, Serialize)]
struct TrajectoryRow {
    keyframe_id: u64,
    timestamp_ns: u64,
    x: f64,
    y: f64,
    z: f64,
    qw: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    low_confidence: bool,
    latitude_deg: Option<f64>,
    longitude_deg: Option<f64>,
    altitude_m: Option<f64>,
}

#[derive(Debug, Serialize)]
struct LandmarkRow {
    landmark_id: u64,
    x: f64,
    y: f64,
    z: f64,
    observations: usize,
    confidence: f64,
    latitude_deg: Option<f64>,
    longitude_deg: Option<f64>,
    altitude_m: Option<f64>,
}

/// Files written by [`export_csv`].
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub trajectory: PathBuf,
    pub landmarks: PathBuf,
    pub keyframe_rows: usize,
    pub landmark_rows: usize,
}

/// Write `trajectory.csv` and `landmarks.csv` into `out_dir`.
/// Geodetic columns are filled only when `anchor` is given.
pub fn export_csv(
    graph: &PoseGraph,
    tracker: &LandmarkTracker,
    anchor: Option<&GeoAnchorTransform>,
    out_dir: &Path,
) -> Result<ExportSummary, StorageError> {
    fs::create_dir_all(out_dir).map_err(|e| StorageError::io(out_dir, e))?;

    let trajectory = out_dir.join(TRAJECTORY_CSV);
    let mut writer = open_writer(&trajectory)?;
    let mut keyframe_rows = 0;
    for kf in graph.keyframes() {
        let t = kf.pose.translation;
        let q = kf.pose.rotation;
        let geo = anchor.map(|a| a.local_to_geo(&t));
        write_row(
            &mut writer,
            &trajectory,
            &TrajectoryRow {
                keyframe_id: kf.id.0,
                timestamp_ns: kf.timestamp_ns,
                x: t.x,
                y: t.y,
                z: t.z,
                qw: q.w,
                qx: q.i,
                qy: q.j,
                qz: q.k,
                low_confidence: kf.low_confidence,
                latitude_deg: geo.map(|g| g.latitude_deg),
                longitude_deg: geo.map(|g| g.longitude_deg),
                altitude_m: geo.map(|g| g.altitude_m),
            },
        )?;
        keyframe_rows += 1;
    }
    flush(writer, &trajectory)?;

    let landmarks = out_dir.join(LANDMARKS_CSV);
    let mut writer = open_writer(&landmarks)?;
    let mut landmark_rows = 0;
    for lm in tracker.landmarks() {
        let Some(p) = lm.position.filter(|_| lm.is_confirmed()) else {
            continue;
        };
        let geo = anchor.map(|a| a.local_to_geo(&p));
        write_row(
            &mut writer,
            &landmarks,
            &LandmarkRow {
                landmark_id: lm.id.0,
                x: p.x,
                y: p.y,
                z: p.z,
                observations: lm.num_observations(),
                confidence: lm.confidence(),
                latitude_deg: geo.map(|g| g.latitude_deg),
                longitude_deg: geo.map(|g| g.longitude_deg),
                altitude_m: geo.map(|g| g.altitude_m),
            },
        )?;
        landmark_rows += 1;
    }
    flush(writer, &landmarks)?;

    Ok(ExportSummary {
        trajectory,
        landmarks,
        keyframe_rows,
        landmark_rows,
    })
}

fn open_writer(path: &Path) -> Result<Writer<fs::File>, StorageError> {
    Writer::from_path(path).map_err(|source| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

fn write_row<T: Serialize>(writer: &mut Writer<fs::File>, path: &Path, row: &T) -> Result<(), StorageError> {
    writer.serialize(row).map_err(|source| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

fn flush(mut writer: Writer<fs::File>, path: &Path) -> Result<(), StorageError> {
    writer.flush().map_err(|e| StorageError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::KeyFrame;
    use crate::pose_graph::{Constraint, ConstraintKind};
    use crate::simulation::{straight_walk, SyntheticWorld, WorldConfig};

    #[test]
    fn test_export_writes_one_row_per_keyframe_and_confirmed_landmark() {
        let mut world = SyntheticWorld::new(WorldConfig::default());
        let mut graph = PoseGraph::new();
        let mut tracker = LandmarkTracker::default();
        for (pose, ts) in straight_walk(3, 0.5, 0, 500_000_000) {
            let frame = world.render(pose, ts);
            let kf = KeyFrame::from_observation(graph.next_keyframe_id(), &frame, false);
            tracker.associate(&kf, &graph);
            let constraints = graph
                .last_keyframe()
                .map(|prev| vec![Constraint::between(prev, &kf, ConstraintKind::Sequential, 1.0)])
                .unwrap_or_default();
            graph.insert(kf, constraints).unwrap();
        }
        let out = tempfile::tempdir().unwrap();
        let summary = export_csv(&graph, &tracker, None, out.path()).unwrap();
        assert_eq!(summary.keyframe_rows, 3);
        assert_eq!(summary.landmark_rows, tracker.confirmed_count());

        let mut reader = csv::Reader::from_path(&summary.trajectory).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "keyframe_id");
        assert_eq!(reader.records().count(), 3);

        let text = fs::read_to_string(&summary.landmarks).unwrap();
        assert_eq!(text.lines().count(), tracker.confirmed_count() + 1);
    }
}
