//! Immutable per-tick snapshots.
//!
//! # Publish Protocol
//!
//! ```text
//! tick thread                         workers
//! ───────────                         ───────
//! capture host frame (exclusive)
//! freeze tracked-sets (Arc clone)
//! build Snapshot, wrap in Arc ──────► read-only for the whole tick
//!    ...                              (no locks: nothing writes it)
//! drop Arc at tick end
//! ```
//!
//! A snapshot is never patched. The next tick always publishes a fresh one,
//! and a worker that straggles past its deadline keeps reading the old one
//! safely until it drops its reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use rgb_spatial::SpatialIndex;
use rustc_hash::FxBuildHasher;
use tracing::trace;

use crate::config::TrackingRules;
use crate::error::SnapshotError;
use crate::host::HostState;
use crate::record::{EntityId, EntityRecord, ObserverId, ObserverRecord, TrackedSet};

/// An observer plus its tracked-set frozen at publish time.
#[derive(Clone, Debug)]
pub struct ObserverView {
    pub record: ObserverRecord,
    /// Read-only copy of the live tracked-set. Workers never see the live one.
    pub tracked: Arc<TrackedSet>,
}

/// Immutable state for one tick.
pub struct Snapshot {
    tick: u64,
    entities: HashMap<EntityId, EntityRecord, FxBuildHasher>,
    observers: BTreeMap<ObserverId, ObserverView>,
    index: SpatialIndex<EntityId>,
    rules: Arc<TrackingRules>,
}

impl Snapshot {
    /// Tick sequence number this snapshot is valid for.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Rules every worker evaluates this tick under.
    #[must_use]
    pub fn rules(&self) -> &TrackingRules {
        &self.rules
    }

    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    #[must_use]
    pub fn observer(&self, id: ObserverId) -> Option<&ObserverView> {
        self.observers.get(&id)
    }

    /// Observers in ascending id order.
    pub fn observers(&self) -> impl Iterator<Item = &ObserverView> {
        self.observers.values()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// The spatial index over entity positions.
    #[must_use]
    pub fn index(&self) -> &SpatialIndex<EntityId> {
        &self.index
    }

    /// Every entity this observer must be evaluated against, ascending.
    ///
    /// Entities in cells within the observer's radius, plus everything it
    /// already tracks (so leaving or despawned entities can be stopped).
    /// The observer's own entity is only kept when it is already tracked,
    /// so evaluation can stop it. Empty for unknown observers.
    #[must_use]
    pub fn candidate_pool(&self, observer: ObserverId) -> Vec<EntityId> {
        let Some(view) = self.observers.get(&observer) else {
            return Vec::new();
        };

        let record = &view.record;
        let mut pool = Vec::with_capacity(view.tracked.len());
        self.index
            .query_disc(record.position.x, record.position.z, record.radius, &mut pool);
        if let Some(own) = record.self_entity {
            pool.retain(|id| *id != own);
        }

        pool.extend(view.tracked.keys().copied());
        pool.sort_unstable();
        pool.dedup();
        pool
    }
}

impl core::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Snapshot")
            .field("tick", &self.tick)
            .field("entities", &self.entities.len())
            .field("observers", &self.observers.len())
            .field("cells", &self.index.occupied_cells())
            .finish()
    }
}

/// Publishes one snapshot per tick.
///
/// Owned by a single coordinator (one per region); there is no global cache.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    last_tick: Option<u64>,
}

impl SnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick of the most recent successful publish.
    #[must_use]
    pub fn last_tick(&self) -> Option<u64> {
        self.last_tick
    }

    /// Capture host state into a new immutable snapshot.
    ///
    /// Must run on the tick thread, which is what guarantees the capture sees
    /// a consistent point in time. Observers missing from `tracked` start
    /// with an empty tracked-set.
    pub fn publish<H: HostState + ?Sized>(
        &mut self,
        tick: u64,
        host: &H,
        tracked: &BTreeMap<ObserverId, Arc<TrackedSet>>,
        rules: Arc<TrackingRules>,
    ) -> Result<Arc<Snapshot>, SnapshotError> {
        if let Some(last) = self.last_tick {
            if tick <= last {
                return Err(SnapshotError::StaleTick { tick, last });
            }
        }

        let frame = host.capture()?;

        let mut entities: HashMap<EntityId, EntityRecord, FxBuildHasher> =
            HashMap::with_capacity_and_hasher(frame.entities.len(), FxBuildHasher);
        let mut index = SpatialIndex::new(rules.cell_shift());

        for record in frame.entities {
            if entities.insert(record.id, record).is_some() {
                return Err(SnapshotError::DuplicateEntity(record.id));
            }
            // Non-finite entities stay out of the index; they surface as
            // evaluation failures only where already tracked.
            if record.position.is_finite() {
                index.insert(record.id, record.position.x, record.position.z);
            }
        }

        let empty = Arc::new(TrackedSet::new());
        let mut observers = BTreeMap::new();

        for record in frame.observers {
            if !record.position.is_finite() || !record.radius.is_finite() || record.radius < 0.0
            {
                return Err(SnapshotError::InvalidObserver(record.id));
            }

            let frozen = tracked
                .get(&record.id)
                .map_or_else(|| Arc::clone(&empty), Arc::clone);

            let view = ObserverView {
                record,
                tracked: frozen,
            };
            if observers.insert(record.id, view).is_some() {
                return Err(SnapshotError::DuplicateObserver(record.id));
            }
        }

        trace!(
            tick,
            entities = entities.len(),
            observers = observers.len(),
            "published snapshot"
        );

        self.last_tick = Some(tick);

        Ok(Arc::new(Snapshot {
            tick,
            entities,
            observers,
            index,
            rules,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::host::HostFrame;
    use crate::record::{EntityCategory, KnownState, Vec3};

    fn entity(id: u64, x: f64) -> EntityRecord {
        EntityRecord::new(EntityId(id), Vec3::new(x, 64.0, 0.0), EntityCategory::Monster)
    }

    fn observer(id: u64, x: f64, radius: f64) -> ObserverRecord {
        ObserverRecord::new(ObserverId(id), Vec3::new(x, 64.0, 0.0), radius)
    }

    fn publish(frame: &HostFrame) -> Arc<Snapshot> {
        SnapshotStore::new()
            .publish(1, frame, &BTreeMap::new(), Arc::default())
            .unwrap()
    }

    struct BrokenHost;

    impl HostState for BrokenHost {
        fn capture(&self) -> Result<HostFrame, HostError> {
            Err(HostError::new("world is mid-save"))
        }
    }

    #[test]
    fn test_publish_reads_records() {
        let frame = HostFrame {
            entities: vec![entity(1, 5.0), entity(2, 50.0)],
            observers: vec![observer(10, 0.0, 10.0)],
        };
        let snapshot = publish(&frame);

        assert_eq!(snapshot.tick(), 1);
        assert_eq!(snapshot.entity_count(), 2);
        assert_eq!(snapshot.entity(EntityId(2)).unwrap().position.x, 50.0);
        assert!(snapshot.observer(ObserverId(10)).unwrap().tracked.is_empty());
        assert!(snapshot.entity(EntityId(3)).is_none());
    }

    #[test]
    fn test_snapshot_is_isolated_from_host_mutation() {
        let mut frame = HostFrame {
            entities: vec![entity(1, 5.0)],
            observers: vec![observer(10, 0.0, 10.0)],
        };
        let snapshot = publish(&frame);

        frame.entities[0].position.x = 500.0;
        frame.observers.clear();

        assert_eq!(snapshot.entity(EntityId(1)).unwrap().position.x, 5.0);
        assert!(snapshot.observer(ObserverId(10)).is_some());
    }

    #[test]
    fn test_candidate_pool_includes_tracked_and_excludes_self() {
        let mut own = observer(10, 0.0, 10.0);
        own.self_entity = Some(EntityId(1));

        let frame = HostFrame {
            entities: vec![entity(1, 0.0), entity(2, 3.0), entity(3, 500.0)],
            observers: vec![own],
        };

        let far = entity(3, 500.0);
        let mut tracked = BTreeMap::new();
        let set: TrackedSet = [
            (EntityId(3), KnownState::of(&far, 0)),
            (EntityId(99), KnownState::of(&far, 0)),
        ]
        .into_iter()
        .collect();
        tracked.insert(ObserverId(10), Arc::new(set));

        let snapshot = SnapshotStore::new()
            .publish(1, &frame, &tracked, Arc::default())
            .unwrap();

        // 2 is nearby, 3 and 99 are tracked (99 despawned), 1 is the observer itself
        assert_eq!(
            snapshot.candidate_pool(ObserverId(10)),
            vec![EntityId(2), EntityId(3), EntityId(99)]
        );
        assert!(snapshot.candidate_pool(ObserverId(11)).is_empty());
    }

    #[test]
    fn test_candidate_pool_keeps_tracked_self() {
        let mut own = observer(10, 0.0, 10.0);
        own.self_entity = Some(EntityId(1));

        let body = entity(1, 0.0);
        let frame = HostFrame {
            entities: vec![body, entity(2, 3.0)],
            observers: vec![own],
        };

        // Tracked before the host tied the body to the observer
        let set: TrackedSet = std::iter::once((EntityId(1), KnownState::of(&body, 0))).collect();
        let tracked = BTreeMap::from([(ObserverId(10), Arc::new(set))]);

        let snapshot = SnapshotStore::new()
            .publish(1, &frame, &tracked, Arc::default())
            .unwrap();

        assert_eq!(
            snapshot.candidate_pool(ObserverId(10)),
            vec![EntityId(1), EntityId(2)]
        );
    }

    #[test]
    fn test_frozen_tracked_set_shares_allocation() {
        let frame = HostFrame {
            entities: vec![],
            observers: vec![observer(10, 0.0, 10.0)],
        };
        let live = Arc::new(TrackedSet::new());
        let mut tracked = BTreeMap::new();
        tracked.insert(ObserverId(10), Arc::clone(&live));

        let snapshot = SnapshotStore::new()
            .publish(1, &frame, &tracked, Arc::default())
            .unwrap();

        assert!(Arc::ptr_eq(
            &snapshot.observer(ObserverId(10)).unwrap().tracked,
            &live
        ));
    }

    #[test]
    fn test_duplicate_entity_fails() {
        let frame = HostFrame {
            entities: vec![entity(1, 0.0), entity(1, 2.0)],
            observers: vec![],
        };
        let err = SnapshotStore::new()
            .publish(1, &frame, &BTreeMap::new(), Arc::default())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::DuplicateEntity(EntityId(1))));
    }

    #[test]
    fn test_invalid_observer_fails() {
        let frame = HostFrame {
            entities: vec![],
            observers: vec![observer(10, f64::NAN, 10.0)],
        };
        let err = SnapshotStore::new()
            .publish(1, &frame, &BTreeMap::new(), Arc::default())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidObserver(ObserverId(10))));
    }

    #[test]
    fn test_host_failure_is_reported() {
        let mut store = SnapshotStore::new();
        let err = store
            .publish(1, &BrokenHost, &BTreeMap::new(), Arc::default())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Host(_)));
        assert_eq!(store.last_tick(), None);
    }

    #[test]
    fn test_ticks_must_advance() {
        let frame = HostFrame::default();
        let mut store = SnapshotStore::new();
        store
            .publish(5, &frame, &BTreeMap::new(), Arc::default())
            .unwrap();

        let err = store
            .publish(5, &frame, &BTreeMap::new(), Arc::default())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::StaleTick { tick: 5, last: 5 }));

        assert!(
            store
                .publish(6, &frame, &BTreeMap::new(), Arc::default())
                .is_ok()
        );
    }
}
