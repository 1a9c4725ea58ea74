//! RGB Spatial Index
//!
//! Buckets ids into horizontal cells (`x >> shift`, `z >> shift`) so interest
//! queries only visit cells that can intersect an observer's radius.
//! The vertical axis is ignored, matching how tracking range is measured.

pub mod cell;
pub mod grid;

pub use cell::{CellKey, DEFAULT_CELL_SHIFT};
pub use grid::SpatialIndex;
