//! Horizontal cell keys.

/// Cell size in blocks as a power of two (16 blocks, same as Minecraft chunks).
pub const DEFAULT_CELL_SHIFT: u32 = 4;

/// Integer coordinates of a horizontal cell.
///
/// Ordering is `x` first, then `z`, which gives a stable row-major walk
/// over a set of cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub x: i32,
    pub z: i32,
}

impl CellKey {
    /// Create a cell key from cell coordinates.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Cell containing the world position `(x, z)`.
    ///
    /// Arithmetic shift floors toward negative infinity, so `-0.5` lands in
    /// cell `-1`, not `0`.
    #[inline]
    #[must_use]
    pub fn containing(x: f64, z: f64, shift: u32) -> Self {
        Self {
            x: (x.floor() as i32) >> shift,
            z: (z.floor() as i32) >> shift,
        }
    }

    /// Chebyshev distance between two cells, in cells.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> i32 {
        let dx = (self.x - other.x).abs();
        let dz = (self.z - other.z).abs();
        dx.max(dz)
    }

    /// Squared horizontal distance from `(x, z)` to the nearest point of this cell.
    ///
    /// Zero when the point lies inside the cell.
    #[must_use]
    pub fn min_distance_sq(self, x: f64, z: f64, shift: u32) -> f64 {
        let size = f64::from(1u32 << shift);
        let min_x = f64::from(self.x) * size;
        let min_z = f64::from(self.z) * size;

        let dx = axis_gap(x, min_x, min_x + size);
        let dz = axis_gap(z, min_z, min_z + size);
        dx * dx + dz * dz
    }
}

#[inline]
fn axis_gap(value: f64, min: f64, max: f64) -> f64 {
    if value < min {
        min - value
    } else if value > max {
        value - max
    } else {
        0.0
    }
}
