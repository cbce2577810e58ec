//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Used for the geo-anchor transform that carries local map coordinates into a
//! local East-North-Up frame. Scale stays close to 1.0 for metric AR tracking
//! but is solved for anyway so tracking scale error shows up in diagnostics.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Transforms points as p' = s * R * p + t.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// S^{-1} = [(1/s) R^T | -(1/s) R^T t].
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        let scale = 1.0 / self.scale;
        Self {
            rotation,
            translation: -(rotation * self.translation) * scale,
            scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }
}
