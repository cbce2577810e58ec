//! Synthetic frame, position and location suppliers.
//!
//! Used by the test-suite and by the `simulate` command of the binary to drive
//! a session without a device.

pub mod scenario;
pub mod world;

pub use scenario::{GeoReference, ScenarioConfig, SensorEvent, SyntheticScenario};
pub use world::{straight_walk, SyntheticWorld, WorldConfig};
