//! Entity and observer records.
//!
//! Records are plain `Copy` values captured from the host at publish time.
//! Nothing here points back into host memory, which is what lets a
//! snapshot outlive the host state it was taken from.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a tracked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Identifier of an observer (a player connection).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

/// Identifier of an independently ticked region.
///
/// Each region owns its own engine; snapshots and work units never span two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RegionId(pub u32);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// World position.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Squared distance ignoring the vertical axis.
    ///
    /// Tracking range is a horizontal disc; height never hides an entity.
    #[inline]
    #[must_use]
    pub fn horizontal_distance_sq(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        dx * dx + dz * dz
    }

    #[inline]
    #[must_use]
    pub fn distance_sq(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

/// Orientation in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Rotation {
    pub yaw: f32,
    pub pitch: f32,
}

impl Rotation {
    #[must_use]
    pub const fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }

    /// Largest per-axis change between two orientations.
    ///
    /// Yaw wraps, so 359 to 1 is a change of 2 degrees.
    #[must_use]
    pub fn max_delta(self, other: Self) -> f32 {
        let yaw = (self.yaw - other.yaw).rem_euclid(360.0);
        let yaw = yaw.min(360.0 - yaw);
        let pitch = (self.pitch - other.pitch).abs();
        yaw.max(pitch)
    }
}

/// Entity category. Selects the tracking radius cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityCategory {
    Player,
    Monster,
    Animal,
    Ambient,
    Projectile,
    Item,
    Vehicle,
    Misc,
}

impl EntityCategory {
    pub const ALL: [Self; 8] = [
        Self::Player,
        Self::Monster,
        Self::Animal,
        Self::Ambient,
        Self::Projectile,
        Self::Item,
        Self::Vehicle,
        Self::Misc,
    ];
}

/// A dynamic entity as the host sees it this tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub position: Vec3,
    pub rotation: Rotation,
    pub category: EntityCategory,
    /// Bumped by the host whenever entity metadata changes.
    pub revision: u64,
}

impl EntityRecord {
    #[must_use]
    pub const fn new(id: EntityId, position: Vec3, category: EntityCategory) -> Self {
        Self {
            id,
            position,
            rotation: Rotation::new(0.0, 0.0),
            category,
            revision: 0,
        }
    }
}

/// An observer as the host sees it this tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObserverRecord {
    pub id: ObserverId,
    pub position: Vec3,
    /// Configured interest radius in blocks.
    pub radius: f64,
    /// The observer's own entity, never tracked by itself.
    pub self_entity: Option<EntityId>,
}

impl ObserverRecord {
    #[must_use]
    pub const fn new(id: ObserverId, position: Vec3, radius: f64) -> Self {
        Self {
            id,
            position,
            radius,
            self_entity: None,
        }
    }
}

/// What an observer was last told about a tracked entity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KnownState {
    pub position: Vec3,
    pub rotation: Rotation,
    pub revision: u64,
    /// Tick at which this state was sent.
    pub synced_tick: u64,
}

impl KnownState {
    #[must_use]
    pub const fn of(record: &EntityRecord, tick: u64) -> Self {
        Self {
            position: record.position,
            rotation: record.rotation,
            revision: record.revision,
            synced_tick: tick,
        }
    }
}

/// Entities an observer currently tracks, keyed by id.
///
/// The key set is the tracked-set; values record the last state sent so
/// workers can decide whether an update is material.
pub type TrackedSet = BTreeMap<EntityId, KnownState>;
