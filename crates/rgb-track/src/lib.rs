//! Off-thread entity tracking with a deterministic per-tick merge.
//!
//! Each tick decides, for every observer, which entities it should start
//! tracking, stop tracking, or receive an update for. The expensive part runs
//! on a worker pool against an immutable snapshot. Only the final apply
//! touches live state, and it always runs on the tick thread.
//!
//! # Tick Execution Model
//!
//! ```text
//! Tick N (tick thread unless noted):
//! ┌──────────────────────────────────────────────────────────────┐
//! │  1. Publish snapshot (host frame + frozen tracked-sets)      │
//! │  2. Partition into work units (per observer, by cell)        │
//! │  3. Dispatch units to workers   ── or run inline when small, │
//! │                                    disabled, or pool is down │
//! │  4. Await batch until deadline  (workers → merge queue)      │
//! │  5. Drain merge queue, drop stale deltas                     │
//! │  6. Apply complete observers in id order, notify the host    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Observers whose units missed the deadline keep last tick's tracked-set
//! and are re-evaluated next tick. Running with `enabled = false` produces
//! the same tracked-sets tick for tick as the parallel path.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use rgb_track::prelude::*;
//!
//! let frame = HostFrame {
//!     entities: vec![EntityRecord::new(EntityId(1), Vec3::new(4.0, 64.0, 0.0), EntityCategory::Animal)],
//!     observers: vec![ObserverRecord::new(ObserverId(7), Vec3::new(0.0, 64.0, 0.0), 32.0)],
//! };
//!
//! let mut engine = TickCoordinator::new(RegionId(0), TrackerConfig::default(), Arc::new(AdmitAll)).unwrap();
//! let report = engine.tick(1, &frame, &mut DiscardSink);
//!
//! assert_eq!(report.started, 1);
//! assert!(engine.tracked(ObserverId(7)).unwrap().contains_key(&EntityId(1)));
//! ```

pub mod config;
pub mod coordinator;
pub mod delta;
pub mod error;
pub mod evaluate;
pub mod host;
pub mod merge;
pub mod partition;
pub mod pool;
pub mod record;
pub mod snapshot;

pub use config::{CategoryRadius, TrackerConfig, TrackingRules};
pub use coordinator::{TickCoordinator, TickMode, TickPhase, TickReport};
pub use delta::{ActionKind, Delta, Diagnostic, TrackAction, apply_delta};
pub use error::{
    ConfigError, EvalError, HostError, PoolError, SnapshotError, TrackError, TrackResult,
};
pub use evaluate::{evaluate_candidate, evaluate_unit};
pub use host::{AdmitAll, DiscardSink, HostFrame, HostState, TrackingSink, VisibilityFilter};
pub use merge::{DeltaSender, MergeQueue, merge_queue};
pub use partition::{Partitioner, WorkUnit};
pub use pool::{Rejected, TickBatch, WorkerPool};
pub use record::{
    EntityCategory, EntityId, EntityRecord, KnownState, ObserverId, ObserverRecord, RegionId,
    Rotation, TrackedSet, Vec3,
};
pub use snapshot::{ObserverView, Snapshot, SnapshotStore};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        ActionKind, AdmitAll, DiscardSink, EntityCategory, EntityId, EntityRecord, HostFrame,
        HostState, ObserverId, ObserverRecord, RegionId, Rotation, TickCoordinator, TickMode,
        TickReport, TrackAction, TrackerConfig, TrackingSink, Vec3, VisibilityFilter,
    };
}
