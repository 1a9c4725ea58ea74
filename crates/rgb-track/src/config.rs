//! Tracker configuration.
//!
//! Loaded once (usually from TOML), validated, and handed to the coordinator.
//! A changed config is staged and only takes effect at the next tick boundary.
//!
//! ```toml
//! enabled = true
//! worker-threads = 4
//! tick-budget-ms = 50
//! deadline-fraction = 0.5
//!
//! [[category-radius]]
//! category = "item"
//! radius = 32.0
//! ```

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::record::{EntityCategory, EntityRecord, KnownState};

/// Radius cap for one entity category.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CategoryRadius {
    pub category: EntityCategory,
    pub radius: f64,
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrackerConfig {
    /// Off-thread evaluation. When false every tick runs synchronously.
    pub enabled: bool,
    /// Worker pool size. Unset picks a size from the hardware.
    pub worker_threads: Option<usize>,
    /// Nominal tick length in milliseconds.
    pub tick_budget_ms: u64,
    /// Share of the tick budget spent waiting for workers.
    pub deadline_fraction: f64,
    /// Partition target. Unset means four units per worker.
    pub target_units: Option<usize>,
    /// Smallest unit the partitioner emits.
    pub min_unit_size: usize,
    /// Ticks with at most this many units skip the pool.
    pub sequential_threshold: usize,
    /// Queued units above which the pool counts as saturated.
    pub max_backlog: usize,
    /// Position change in blocks that makes an update material.
    pub update_threshold: f64,
    /// Orientation change in degrees that makes an update material.
    pub rotation_threshold: f32,
    /// Ticks after which an idle tracked entity is re-sent. Zero disables.
    pub force_sync_interval: u32,
    /// Spatial cell size as a power of two.
    pub cell_shift: u32,
    /// Per-category radius caps.
    pub category_radius: Vec<CategoryRadius>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_threads: None,
            tick_budget_ms: 50,
            deadline_fraction: 0.5,
            target_units: None,
            min_unit_size: 10,
            sequential_threshold: 4,
            max_backlog: 1024,
            update_threshold: 0.03,
            // One protocol angle step (360 / 256)
            rotation_threshold: 1.406_25,
            force_sync_interval: 20,
            cell_shift: rgb_spatial::DEFAULT_CELL_SHIFT,
            category_radius: Vec::new(),
        }
    }
}

impl TrackerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == Some(0) {
            return Err(invalid("worker-threads", "must be at least 1"));
        }
        if self.tick_budget_ms == 0 {
            return Err(invalid("tick-budget-ms", "must be positive"));
        }
        if !(self.deadline_fraction > 0.0 && self.deadline_fraction <= 1.0) {
            return Err(invalid(
                "deadline-fraction",
                format!("{} is outside (0, 1]", self.deadline_fraction),
            ));
        }
        if self.target_units == Some(0) {
            return Err(invalid("target-units", "must be at least 1"));
        }
        if self.min_unit_size == 0 {
            return Err(invalid("min-unit-size", "must be at least 1"));
        }
        if !(self.update_threshold.is_finite() && self.update_threshold >= 0.0) {
            return Err(invalid("update-threshold", "must be a non-negative number"));
        }
        if !(self.rotation_threshold.is_finite() && self.rotation_threshold >= 0.0) {
            return Err(invalid("rotation-threshold", "must be a non-negative number"));
        }
        if self.cell_shift > 16 {
            return Err(invalid("cell-shift", "must be at most 16"));
        }
        for entry in &self.category_radius {
            if !(entry.radius.is_finite() && entry.radius >= 0.0) {
                return Err(invalid(
                    "category-radius",
                    format!("{:?} radius must be a non-negative number", entry.category),
                ));
            }
        }
        Ok(())
    }

    /// Number of worker threads to run.
    ///
    /// An explicit setting is capped at the hardware concurrency but never
    /// below two; the default is half the cores, between two and four.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        match self.worker_threads {
            Some(requested) => requested.min(cpus).max(2),
            None => (cpus / 2).clamp(2, 4),
        }
    }

    /// Units to aim for per tick.
    #[must_use]
    pub fn target_unit_count(&self, workers: usize) -> usize {
        self.target_units.unwrap_or(workers.max(1) * 4)
    }

    #[must_use]
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    /// How long the coordinator waits for workers each tick.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.tick_budget().mul_f64(self.deadline_fraction)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// The per-tick evaluation rules derived from a [`TrackerConfig`].
///
/// Frozen into every snapshot so one tick is always evaluated under one
/// set of rules, even if the config changes while workers run.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackingRules {
    category_radius: [Option<f64>; EntityCategory::ALL.len()],
    update_threshold_sq: f64,
    rotation_threshold: f32,
    force_sync_interval: u32,
    cell_shift: u32,
}

impl TrackingRules {
    #[must_use]
    pub fn from_config(config: &TrackerConfig) -> Self {
        let mut category_radius = [None; EntityCategory::ALL.len()];
        for entry in &config.category_radius {
            category_radius[entry.category as usize] = Some(entry.radius);
        }

        Self {
            category_radius,
            update_threshold_sq: config.update_threshold * config.update_threshold,
            rotation_threshold: config.rotation_threshold,
            force_sync_interval: config.force_sync_interval,
            cell_shift: config.cell_shift,
        }
    }

    /// Radius within which an entity of `category` is visible to an observer.
    ///
    /// A category cap can only shrink the observer's own radius.
    #[inline]
    #[must_use]
    pub fn effective_radius(&self, observer_radius: f64, category: EntityCategory) -> f64 {
        match self.category_radius[category as usize] {
            Some(cap) => observer_radius.min(cap),
            None => observer_radius,
        }
    }

    /// Whether a tracked entity changed enough since `known` to send an update.
    #[must_use]
    pub fn is_material(&self, known: &KnownState, record: &EntityRecord, tick: u64) -> bool {
        if record.revision != known.revision {
            return true;
        }

        let moved = known.position.distance_sq(record.position);
        if moved > 0.0 && moved >= self.update_threshold_sq {
            return true;
        }

        let turned = known.rotation.max_delta(record.rotation);
        if turned > 0.0 && turned >= self.rotation_threshold {
            return true;
        }

        self.force_sync_interval > 0
            && tick.saturating_sub(known.synced_tick) >= u64::from(self.force_sync_interval)
    }

    #[must_use]
    pub fn cell_shift(&self) -> u32 {
        self.cell_shift
    }
}

impl Default for TrackingRules {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}
