//! Random point world rendered through a pinhole camera.

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::sensors::{CameraIntrinsics, Descriptor, Feature, TrackedFrame, DESCRIPTOR_BYTES};

/// Parameters of the synthetic world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub num_points: usize,
    /// Bounding box `[min_x, max_x, min_y, max_y, min_z, max_z]` in metres.
    pub bounds: [f64; 6],
    pub intrinsics: CameraIntrinsics,
    /// Uniform keypoint noise amplitude (pixels).
    pub pixel_noise_px: f64,
    /// Random descriptor bits flipped per observation.
    pub descriptor_bit_flips: usize,
    pub seed: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            num_points: 800,
            bounds: [-6.0, 20.0, -2.0, 2.0, 3.0, 10.0],
            intrinsics: CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480),
            pixel_noise_px: 0.3,
            descriptor_bit_flips: 3,
            seed: 7,
        }
    }
}

/// Static 3D points, each with its own random descriptor.
pub struct SyntheticWorld {
    config: WorldConfig,
    points: Vec<Vector3<f64>>,
    descriptors: Vec<Descriptor>,
    rng: StdRng,
}

impl SyntheticWorld {
    pub fn new(config: WorldConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let [min_x, max_x, min_y, max_y, min_z, max_z] = config.bounds;

        let points = (0..config.num_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(min_x..max_x),
                    rng.gen_range(min_y..max_y),
                    rng.gen_range(min_z..max_z),
                )
            })
            .collect();
        let descriptors = (0..config.num_points)
            .map(|_| {
                let mut bytes = [0u8; DESCRIPTOR_BYTES];
                rng.fill(&mut bytes[..]);
                Descriptor(bytes)
            })
            .collect();

        Self {
            config,
            points,
            descriptors,
            rng,
        }
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        self.config.intrinsics
    }

    /// Render every visible point into a frame taken from `pose` (`T_wc`).
    pub fn render(&mut self, pose: SE3, timestamp_ns: u64) -> TrackedFrame {
        let intrinsics = self.config.intrinsics;
        let world_to_camera = pose.inverse();
        let noise = self.config.pixel_noise_px;
        let mut features = Vec::new();

        for (point, descriptor) in self.points.iter().zip(&self.descriptors) {
            let p_cam = world_to_camera.transform_point(point);
            if p_cam.z < 0.1 {
                continue;
            }
            let Some(mut px) = intrinsics.project(&p_cam) else {
                continue;
            };
            if !intrinsics.in_image(&px) {
                continue;
            }
            if noise > 0.0 {
                px.x += self.rng.gen_range(-noise..noise);
                px.y += self.rng.gen_range(-noise..noise);
            }

            let mut bytes = descriptor.0;
            for _ in 0..self.config.descriptor_bit_flips {
                let bit = self.rng.gen_range(0..DESCRIPTOR_BYTES * 8);
                bytes[bit / 8] ^= 1 << (bit % 8);
            }
            features.push(Feature::new(px.x, px.y, Descriptor(bytes)));
        }

        TrackedFrame {
            timestamp_ns,
            pose,
            intrinsics,
            features,
        }
    }
}

/// Poses `spacing_m` apart along +x, looking down +z, `interval_ns` apart in time.
pub fn straight_walk(n: usize, spacing_m: f64, start_ns: u64, interval_ns: u64) -> Vec<(SE3, u64)> {
    (0..n)
        .map(|i| {
            let pose = SE3::new(
                UnitQuaternion::identity(),
                Vector3::new(i as f64 * spacing_m, 0.0, 0.0),
            );
            (pose, start_ns + i as u64 * interval_ns)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_deterministic_for_a_seed() {
        let mut a = SyntheticWorld::new(WorldConfig::default());
        let mut b = SyntheticWorld::new(WorldConfig::default());
        let fa = a.render(SE3::identity(), 0);
        let fb = b.render(SE3::identity(), 0);

        assert!(fa.features.len() > 50);
        assert_eq!(fa.features.len(), fb.features.len());
        assert_eq!(fa.features[0], fb.features[0]);
    }

    #[test]
    fn test_looking_away_sees_nothing() {
        let mut world = SyntheticWorld::new(WorldConfig::default());
        let backwards = SE3::new(
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI),
            Vector3::zeros(),
        );
        assert!(world.render(backwards, 0).features.is_empty());
    }

    #[test]
    fn test_straight_walk_spacing() {
        let walk = straight_walk(5, 0.5, 100, 10);
        assert_eq!(walk.len(), 5);
        assert_eq!(walk[4].1, 140);
        assert!((walk[4].0.translation.x - 2.0).abs() < 1e-12);
    }
}
