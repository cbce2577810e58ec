//! Complete synthetic sessions: frames along a walk plus position samples and
//! geolocation fixes generated from a known local-to-ENU transform.

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::world::{SyntheticWorld, WorldConfig};
use crate::geo_anchor::gravity_axes;
use crate::geometry::so3::rotation_z;
use crate::geometry::{GeoCoordinate, LocalTangentFrame, Sim3, SE3};
use crate::sensors::{LocationFix, PositionSample, TrackedFrame};

/// Ground-truth geo-registration of the synthetic local frame.
#[derive(Debug, Clone)]
pub struct GeoReference {
    pub frame: LocalTangentFrame,
    pub local_to_enu: Sim3,
}

impl GeoReference {
    /// Local frame rotated by `yaw_rad` about the vertical, origin at `origin`.
    pub fn new(origin: GeoCoordinate, yaw_rad: f64) -> Self {
        Self {
            frame: LocalTangentFrame::new(origin),
            local_to_enu: Sim3 {
                rotation: rotation_z(yaw_rad) * gravity_axes(),
                translation: Vector3::zeros(),
                scale: 1.0,
            },
        }
    }

    pub fn coordinate_of(&self, local: &Vector3<f64>) -> GeoCoordinate {
        self.frame.to_geodetic(&self.local_to_enu.transform_point(local))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub frames: usize,
    pub spacing_m: f64,
    pub start_ns: u64,
    pub frame_interval_ns: u64,
    /// Frame index after which the walk turns 90° (towards -z).
    pub turn_at: Option<usize>,
    /// Position samples between consecutive frames.
    pub positions_per_frame: usize,
    /// Emit a fix every `fix_every` frames (0 disables fixes).
    pub fix_every: usize,
    /// Delay of each fix after its frame.
    pub fix_offset_ns: u64,
    pub fix_accuracy_m: f64,
    /// Uniform horizontal noise added to fixes (metres).
    pub fix_noise_m: f64,
    pub origin: GeoCoordinate,
    pub yaw_deg: f64,
    pub world: WorldConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            frames: 24,
            spacing_m: 0.5,
            start_ns: 1_000_000_000,
            frame_interval_ns: 500_000_000,
            turn_at: Some(12),
            positions_per_frame: 2,
            fix_every: 3,
            fix_offset_ns: 100_000_000,
            fix_accuracy_m: 3.0,
            fix_noise_m: 0.0,
            origin: GeoCoordinate::new(47.3769, 8.5417, 408.0),
            yaw_deg: 30.0,
            world: WorldConfig::default(),
        }
    }
}

/// One input for the mapper, in arrival order.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    Frame(TrackedFrame),
    Position(PositionSample),
    Location(LocationFix),
}

pub struct SyntheticScenario {
    config: ScenarioConfig,
    world: SyntheticWorld,
    reference: GeoReference,
    rng: StdRng,
}

impl SyntheticScenario {
    pub fn new(config: ScenarioConfig) -> Self {
        let world = SyntheticWorld::new(config.world.clone());
        let reference = GeoReference::new(config.origin, config.yaw_deg.to_radians());
        let rng = StdRng::seed_from_u64(config.world.seed.wrapping_add(1));
        Self {
            config,
            world,
            reference,
            rng,
        }
    }

    pub fn reference(&self) -> &GeoReference {
        &self.reference
    }

    /// Camera centre of frame `i` along the (possibly turning) walk.
    pub fn center(&self, i: f64) -> Vector3<f64> {
        let s = self.config.spacing_m;
        match self.config.turn_at {
            Some(turn) if i > turn as f64 => {
                Vector3::new(turn as f64 * s, 0.0, -(i - turn as f64) * s)
            }
            _ => Vector3::new(i * s, 0.0, 0.0),
        }
    }

    fn timestamp(&self, i: f64) -> u64 {
        self.config.start_ns + (i * self.config.frame_interval_ns as f64) as u64
    }

    /// Generate the whole event stream.
    pub fn events(&mut self) -> Vec<SensorEvent> {
        let mut events = Vec::new();
        let interval = self.config.frame_interval_ns as f64;

        for i in 0..self.config.frames {
            let fi = i as f64;
            let pose = SE3::new(UnitQuaternion::identity(), self.center(fi));
            let timestamp_ns = self.timestamp(fi);
            events.push(SensorEvent::Frame(self.world.render(pose, timestamp_ns)));

            let steps = self.config.positions_per_frame;
            for k in 0..steps {
                let t = fi + k as f64 / steps as f64;
                events.push(SensorEvent::Position(PositionSample::new(
                    self.center(t),
                    self.timestamp(t),
                )));
            }

            if self.config.fix_every > 0 && i % self.config.fix_every == 0 {
                let t = fi + self.config.fix_offset_ns as f64 / interval;
                events.push(SensorEvent::Location(self.fix_at(t)));
            }
        }
        events
    }

    /// Fix for the device position at fractional frame index `t`.
    pub fn fix_at(&mut self, t: f64) -> LocationFix {
        let local = self.center(t);
        let mut enu = self.reference.local_to_enu.transform_point(&local);
        let noise = self.config.fix_noise_m;
        if noise > 0.0 {
            enu.x += self.rng.gen_range(-noise..noise);
            enu.y += self.rng.gen_range(-noise..noise);
        }
        LocationFix::new(
            self.timestamp(t),
            self.reference.frame.to_geodetic(&enu),
            self.config.fix_accuracy_m,
            self.config.fix_accuracy_m * 1.5,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_reference_maps_local_axes_to_enu() {
        let reference = GeoReference::new(GeoCoordinate::new(10.0, 10.0, 0.0), 0.0);
        // local +x is east, local -z is north, local +y is up
        let enu = reference.local_to_enu.transform_point(&Vector3::new(1.0, 2.0, -3.0));
        assert_abs_diff_eq!(enu, Vector3::new(1.0, 3.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_event_stream_contents() {
        let config = ScenarioConfig {
            frames: 6,
            fix_every: 2,
            ..ScenarioConfig::default()
        };
        let mut scenario = SyntheticScenario::new(config);
        let events = scenario.events();

        let frames = events.iter().filter(|e| matches!(e, SensorEvent::Frame(_))).count();
        let positions = events.iter().filter(|e| matches!(e, SensorEvent::Position(_))).count();
        let fixes = events.iter().filter(|e| matches!(e, SensorEvent::Location(_))).count();
        assert_eq!(frames, 6);
        assert_eq!(positions, 12);
        assert_eq!(fixes, 3);
    }

    #[test]
    fn test_walk_turns() {
        let scenario = SyntheticScenario::new(ScenarioConfig {
            turn_at: Some(2),
            spacing_m: 1.0,
            ..ScenarioConfig::default()
        });
        assert_abs_diff_eq!(scenario.center(4.0), Vector3::new(2.0, 0.0, -2.0), epsilon = 1e-12);
        assert_abs_diff_eq!(scenario.center(1.5), Vector3::new(1.5, 0.0, 0.0), epsilon = 1e-12);
    }
}
