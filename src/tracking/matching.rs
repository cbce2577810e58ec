//! Descriptor matching primitives: Hamming thresholds, the ratio test and a
//! coarse spatial grid over a keyframe's features.

use crate::sensors::{Descriptor, Feature};

/// Strict Hamming threshold for accepting a match.
pub const TH_LOW: u32 = 50;
/// Best / second-best ratio for the nearest-neighbour test.
pub const NN_RATIO: f64 = 0.75;

const GRID_CELL_SIZE: f64 = 32.0;
const MAX_GRID_DIM: usize = 128;

/// Best candidate for one query descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub index: usize,
    pub distance: u32,
}

/// Find the closest descriptor among `candidates` (index, descriptor).
///
/// Accepts only if the best distance is at most `max_distance` and, when a
/// second candidate exists, `best < ratio * second_best`.
pub fn best_match<'a, I>(
    query: &Descriptor,
    candidates: I,
    max_distance: u32,
    ratio: f64,
) -> Option<DescriptorMatch>
where
    I: IntoIterator<Item = (usize, &'a Descriptor)>,
{
    let mut best: Option<DescriptorMatch> = None;
    let mut second_best = u32::MAX;

    for (index, descriptor) in candidates {
        let distance = query.distance(descriptor);
        match best {
            Some(b) if distance >= b.distance => {
                second_best = second_best.min(distance);
            }
            _ => {
                if let Some(b) = best {
                    second_best = b.distance;
                }
                best = Some(DescriptorMatch { index, distance });
            }
        }
    }

    let best = best?;
    if best.distance > max_distance {
        return None;
    }
    if second_best != u32::MAX && f64::from(best.distance) >= ratio * f64::from(second_best) {
        return None;
    }
    Some(best)
}

/// Uniform grid bucketing feature indices by pixel position.
pub struct FeatureGrid {
    cells: Vec<Vec<usize>>,
    cols: usize,
    rows: usize,
}

impl FeatureGrid {
    pub fn new(features: &[Feature], width: u32, height: u32) -> Self {
        let max_u = features.iter().map(|f| f.u).fold(f64::from(width), f64::max);
        let max_v = features.iter().map(|f| f.v).fold(f64::from(height), f64::max);
        let cols = ((max_u / GRID_CELL_SIZE).ceil() as usize).clamp(1, MAX_GRID_DIM);
        let rows = ((max_v / GRID_CELL_SIZE).ceil() as usize).clamp(1, MAX_GRID_DIM);

        let mut cells = vec![Vec::new(); cols * rows];
        for (idx, f) in features.iter().enumerate() {
            let (col, row) = Self::cell_of(f.u, f.v, cols, rows);
            cells[row * cols + col].push(idx);
        }

        Self { cells, cols, rows }
    }

    fn cell_of(u: f64, v: f64, cols: usize, rows: usize) -> (usize, usize) {
        let col = ((u.max(0.0) / GRID_CELL_SIZE) as usize).min(cols - 1);
        let row = ((v.max(0.0) / GRID_CELL_SIZE) as usize).min(rows - 1);
        (col, row)
    }

    /// Feature indices in cells overlapping the square of half-size `radius`.
    ///
    /// The caller still has to check the exact pixel distance.
    pub fn candidates(&self, u: f64, v: f64, radius: f64) -> impl Iterator<Item = usize> + '_ {
        let (min_col, min_row) = Self::cell_of(u - radius, v - radius, self.cols, self.rows);
        let (max_col, max_row) = Self::cell_of(u + radius, v + radius, self.cols, self.rows);

        (min_row..=max_row).flat_map(move |row| {
            (min_col..=max_col).flat_map(move |col| self.cells[row * self.cols + col].iter().copied())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::DESCRIPTOR_BYTES;

    fn descriptor_with_bits(bits: usize) -> Descriptor {
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        for i in 0..bits {
            bytes[i / 8] |= 1 << (i % 8);
        }
        Descriptor(bytes)
    }

    #[test]
    fn test_best_match_respects_threshold_and_ratio() {
        let query = descriptor_with_bits(0);
        let near = descriptor_with_bits(5);
        let far = descriptor_with_bits(40);
        let ambiguous = descriptor_with_bits(6);

        let found = best_match(&query, [(0, &far), (1, &near)], TH_LOW, NN_RATIO).unwrap();
        assert_eq!(found, DescriptorMatch { index: 1, distance: 5 });

        // 5 vs 6 fails the ratio test
        assert!(best_match(&query, [(0, &near), (1, &ambiguous)], TH_LOW, NN_RATIO).is_none());

        // Single candidate above the threshold
        let very_far = descriptor_with_bits(120);
        assert!(best_match(&query, [(0, &very_far)], TH_LOW, NN_RATIO).is_none());
        assert!(best_match(&query, std::iter::empty(), TH_LOW, NN_RATIO).is_none());
    }

    #[test]
    fn test_grid_returns_nearby_features() {
        let features = vec![
            Feature::new(10.0, 10.0, Descriptor::default()),
            Feature::new(300.0, 200.0, Descriptor::default()),
            Feature::new(305.0, 210.0, Descriptor::default()),
        ];
        let grid = FeatureGrid::new(&features, 640, 480);

        let mut near: Vec<usize> = grid.candidates(302.0, 205.0, 10.0).collect();
        near.sort();
        assert_eq!(near, vec![1, 2]);

        let corner: Vec<usize> = grid.candidates(0.0, 0.0, 5.0).collect();
        assert_eq!(corner, vec![0]);
    }
}
