//! Sparse cell index.

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::CellKey;

type Bucket<T> = SmallVec<[T; 8]>;

/// A sparse horizontal grid mapping occupied cells to the ids inside them.
///
/// Only occupied cells are stored, so memory scales with the number of ids
/// rather than the extent of the world. Buckets are kept sorted so every
/// query returns ids in ascending order.
pub struct SpatialIndex<T> {
    /// Cell size as a power of two.
    shift: u32,
    /// Occupied cells.
    cells: HashMap<CellKey, Bucket<T>, FxBuildHasher>,
    /// Total number of ids.
    len: usize,
}

impl<T: Copy + Ord> SpatialIndex<T> {
    /// Create an empty index with cells of `1 << shift` blocks.
    #[must_use]
    pub fn new(shift: u32) -> Self {
        Self {
            shift,
            cells: HashMap::default(),
            len: 0,
        }
    }

    /// Cell size exponent.
    #[must_use]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Insert an id at a world position, returning the cell it landed in.
    pub fn insert(&mut self, id: T, x: f64, z: f64) -> CellKey {
        let key = CellKey::containing(x, z, self.shift);
        let bucket = self.cells.entry(key).or_default();
        let at = bucket.partition_point(|held| *held < id);
        bucket.insert(at, id);
        self.len += 1;
        key
    }

    /// Cell containing a world position.
    #[must_use]
    pub fn cell_of(&self, x: f64, z: f64) -> CellKey {
        CellKey::containing(x, z, self.shift)
    }

    /// Ids in a cell, ascending. Empty for unoccupied cells.
    #[must_use]
    pub fn bucket(&self, key: CellKey) -> &[T] {
        match self.cells.get(&key) {
            Some(bucket) => bucket.as_slice(),
            None => &[],
        }
    }

    /// Occupied cells intersecting the horizontal disc around `(x, z)`, sorted.
    ///
    /// Walks whichever is smaller: the disc's bounding cell range or the set
    /// of occupied cells.
    #[must_use]
    pub fn cells_in_disc(&self, x: f64, z: f64, radius: f64) -> Vec<CellKey> {
        if !radius.is_finite() || radius < 0.0 || !x.is_finite() || !z.is_finite() {
            return Vec::new();
        }

        let radius_sq = radius * radius;
        let low = self.cell_of(x - radius, z - radius);
        let high = self.cell_of(x + radius, z + radius);
        // Saturated coordinates can span more cells than an i64 counts
        let span = (i64::from(high.x) - i64::from(low.x) + 1)
            .checked_mul(i64::from(high.z) - i64::from(low.z) + 1);
        let walk_range = span.is_some_and(|span| span <= self.cells.len() as i64);

        let mut found: Vec<CellKey> = if walk_range {
            let mut keys = Vec::new();
            for cx in low.x..=high.x {
                for cz in low.z..=high.z {
                    let key = CellKey::new(cx, cz);
                    if self.cells.contains_key(&key)
                        && key.min_distance_sq(x, z, self.shift) <= radius_sq
                    {
                        keys.push(key);
                    }
                }
            }
            keys
        } else {
            self.cells
                .keys()
                .copied()
                .filter(|key| key.min_distance_sq(x, z, self.shift) <= radius_sq)
                .collect()
        };

        found.sort_unstable();
        found
    }

    /// Append every id in cells intersecting the disc to `out`.
    ///
    /// Ids are grouped by cell; callers that need a global order sort `out`.
    pub fn query_disc(&self, x: f64, z: f64, radius: f64, out: &mut Vec<T>) {
        for key in self.cells_in_disc(x, z, radius) {
            out.extend_from_slice(self.bucket(key));
        }
    }

    /// Number of occupied cells.
    #[must_use]
    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    /// Total number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the index holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> core::fmt::Debug for SpatialIndex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("shift", &self.shift)
            .field("cells", &self.cells.len())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sorted_buckets() {
        let mut index = SpatialIndex::new(4);
        index.insert(7u64, 1.0, 1.0);
        index.insert(3u64, 2.0, 2.0);
        index.insert(5u64, 3.0, 3.0);

        assert_eq!(index.bucket(CellKey::new(0, 0)), &[3, 5, 7]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.occupied_cells(), 1);
    }

    #[test]
    fn test_empty_bucket() {
        let index: SpatialIndex<u64> = SpatialIndex::new(4);
        assert!(index.bucket(CellKey::new(10, 10)).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_cells_in_disc_excludes_far_cells() {
        let mut index = SpatialIndex::new(4);
        index.insert(1u64, 5.0, 0.0);
        index.insert(2u64, 50.0, 0.0);
        index.insert(3u64, -20.0, -20.0);

        let cells = index.cells_in_disc(0.0, 0.0, 10.0);
        assert_eq!(cells, vec![CellKey::new(0, 0)]);

        let mut ids = Vec::new();
        index.query_disc(0.0, 0.0, 10.0, &mut ids);
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_cells_in_disc_both_strategies_agree() {
        let mut index = SpatialIndex::new(4);
        for i in 0..40u64 {
            let x = (i as f64) * 7.0 - 140.0;
            let z = (i as f64) * -3.0 + 60.0;
            index.insert(i, x, z);
        }

        // Small radius walks the bounding range, huge radius walks occupied cells
        let small = index.cells_in_disc(0.0, 0.0, 40.0);
        let mut brute: Vec<CellKey> = index
            .cells
            .keys()
            .copied()
            .filter(|key| key.min_distance_sq(0.0, 0.0, 4) <= 1600.0)
            .collect();
        brute.sort_unstable();
        assert_eq!(small, brute);

        let huge = index.cells_in_disc(0.0, 0.0, 1.0e6);
        assert_eq!(huge.len(), index.occupied_cells());
    }

    #[test]
    fn test_cells_in_disc_past_i32_range() {
        let mut index = SpatialIndex::new(0);
        index.insert(1u64, 0.0, 0.0);
        index.insert(2, -70_000.0, 5.5);
        index.insert(3, 2.0e9, -2.0e9);

        // Both axes saturate to the full i32 range at shift 0
        let cells = index.cells_in_disc(0.0, 0.0, 3.0e9);
        assert_eq!(cells.len(), index.occupied_cells());

        let mut ids = Vec::new();
        index.query_disc(0.0, 0.0, 3.0e9, &mut ids);
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_radius_yields_nothing() {
        let mut index = SpatialIndex::new(4);
        index.insert(1u64, 0.0, 0.0);

        assert!(index.cells_in_disc(0.0, 0.0, -1.0).is_empty());
        assert!(index.cells_in_disc(0.0, 0.0, f64::NAN).is_empty());
        assert!(index.cells_in_disc(f64::INFINITY, 0.0, 5.0).is_empty());
    }
}
