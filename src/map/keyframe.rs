//! KeyFrame - a retained, pose-stamped observation.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::types::KeyFrameId;
use crate::geometry::SE3;
use crate::sensors::{CameraIntrinsics, Feature, FrameObservation};

/// A keyframe in the local map.
///
/// Owned by the pose graph. Everything except `pose` is fixed at creation;
/// the pose is rewritten only by refinement passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Capture time in sensor nanoseconds.
    pub timestamp_ns: u64,

    /// Camera-to-map transform (`T_wc`).
    pub pose: SE3,

    pub intrinsics: CameraIntrinsics,

    pub features: Vec<Feature>,

    /// Set when the frame arrived out of timestamp order.
    #[serde(default)]
    pub low_confidence: bool,
}

impl KeyFrame {
    pub fn from_observation<F: FrameObservation + ?Sized>(
        id: KeyFrameId,
        frame: &F,
        low_confidence: bool,
    ) -> Self {
        Self {
            id,
            timestamp_ns: frame.timestamp_ns(),
            pose: frame.pose(),
            intrinsics: frame.intrinsics(),
            features: frame.features().to_vec(),
            low_confidence,
        }
    }

    /// Camera centre in the map frame.
    pub fn center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// Project a map-frame point into this keyframe's image.
    ///
    /// Returns the pixel and the depth along the optical axis, or `None` if the
    /// point is behind the camera.
    pub fn project(&self, p_world: &Vector3<f64>) -> Option<(Vector2<f64>, f64)> {
        let p_cam = self.pose.inverse().transform_point(p_world);
        self.intrinsics.project(&p_cam).map(|px| (px, p_cam.z))
    }

    /// Viewing ray of a feature, in the map frame (not normalized).
    pub fn bearing(&self, feature_index: usize) -> Option<Vector3<f64>> {
        let f = self.features.get(feature_index)?;
        Some(self.pose.rotation * self.intrinsics.unproject(f.u, f.v))
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{Descriptor, TrackedFrame};
    use approx::assert_relative_eq;

    fn keyframe_at(x: f64) -> KeyFrame {
        let frame = TrackedFrame {
            timestamp_ns: 10,
            pose: SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0)),
            intrinsics: CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480),
            features: vec![Feature::new(320.0, 240.0, Descriptor::default())],
        };
        KeyFrame::from_observation(KeyFrameId::new(0), &frame, false)
    }

    #[test]
    fn test_project_accounts_for_pose() {
        let kf = keyframe_at(1.0);
        let (px, depth) = kf.project(&Vector3::new(1.0, 0.0, 4.0)).unwrap();
        assert_relative_eq!(px, Vector2::new(320.0, 240.0), epsilon = 1e-12);
        assert_relative_eq!(depth, 4.0, epsilon = 1e-12);

        assert!(kf.project(&Vector3::new(1.0, 0.0, -4.0)).is_none());
    }

    #[test]
    fn test_bearing_of_principal_point_is_optical_axis() {
        let kf = keyframe_at(0.0);
        assert_relative_eq!(kf.bearing(0).unwrap(), Vector3::z(), epsilon = 1e-12);
        assert!(kf.bearing(1).is_none());
    }
}
