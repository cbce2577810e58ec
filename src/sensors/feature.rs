//! Image features: pixel keypoint plus a 256-bit binary descriptor.

use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_BYTES: usize = 32;

/// Binary descriptor (ORB/BRIEF layout) compared by Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Number of differing bits.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A detected keypoint with its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub u: f64,
    pub v: f64,
    pub descriptor: Descriptor,
}

impl Feature {
    pub fn new(u: f64, v: f64, descriptor: Descriptor) -> Self {
        Self { u, v, descriptor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor([0u8; DESCRIPTOR_BYTES]);
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        bytes[0] = 0b1011_0000;
        bytes[31] = 0xFF;
        let b = Descriptor(bytes);

        assert_eq!(a.distance(&b), 11);
        assert_eq!(b.distance(&a), 11);
        assert_eq!(a.distance(&a), 0);
    }
}
