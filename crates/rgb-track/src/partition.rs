//! Splitting a tick's tracking work into independent units.
//!
//! Work is grouped by observer first, so every delta is attributable to
//! exactly one observer and never needs a cross-observer merge. Each
//! observer's candidate pool is then cut along spatial cells so units stay
//! close to a common size and one crowded area cannot pin a single worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use rgb_spatial::CellKey;

use crate::record::{EntityId, ObserverId};
use crate::snapshot::Snapshot;

/// One observer's slice of candidates for one tick.
#[derive(Clone)]
pub struct WorkUnit {
    pub observer: ObserverId,
    /// Position in the tick's unit sequence.
    pub seq: usize,
    /// Index among this observer's units; deltas are merged in this order.
    pub part: u32,
    /// Number of units this observer's pool was split into.
    pub parts: u32,
    /// Candidates, ascending. Disjoint from every other unit of this observer.
    pub entities: Vec<EntityId>,
    pub snapshot: Arc<Snapshot>,
}

impl WorkUnit {
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.snapshot.tick()
    }
}

impl core::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("observer", &self.observer)
            .field("seq", &self.seq)
            .field("part", &self.part)
            .field("parts", &self.parts)
            .field("entities", &self.entities.len())
            .field("tick", &self.snapshot.tick())
            .finish()
    }
}

/// Derives work units from a snapshot.
#[derive(Clone, Copy, Debug)]
pub struct Partitioner {
    min_unit_size: usize,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Partitioner {
    #[must_use]
    pub fn new(min_unit_size: usize) -> Self {
        Self {
            min_unit_size: min_unit_size.max(1),
        }
    }

    /// Split every observer's candidate pool into units.
    ///
    /// Units come out ordered by ascending observer id, then by ascending
    /// first entity id. Observers with an empty pool get no units.
    #[must_use]
    pub fn partition(&self, snapshot: &Arc<Snapshot>, target_unit_count: usize) -> Vec<WorkUnit> {
        let pools: Vec<(ObserverId, Vec<EntityId>)> = snapshot
            .observers()
            .map(|view| (view.record.id, snapshot.candidate_pool(view.record.id)))
            .filter(|(_, pool)| !pool.is_empty())
            .collect();

        let total: usize = pools.iter().map(|(_, pool)| pool.len()).sum();
        let unit_size = total
            .div_ceil(target_unit_count.max(1))
            .max(self.min_unit_size);

        let mut units = Vec::new();

        for (observer, pool) in pools {
            let mut parts = split_pool(snapshot, &pool, unit_size);
            for part in &mut parts {
                part.sort_unstable();
            }
            parts.sort_unstable_by_key(|part| part[0]);

            let count = parts.len() as u32;
            for (index, entities) in parts.into_iter().enumerate() {
                units.push(WorkUnit {
                    observer,
                    seq: units.len(),
                    part: index as u32,
                    parts: count,
                    entities,
                    snapshot: Arc::clone(snapshot),
                });
            }
        }

        units
    }
}

/// Cut one pool into non-empty parts of roughly `unit_size`, keeping cells together
/// where they fit.
fn split_pool(snapshot: &Snapshot, pool: &[EntityId], unit_size: usize) -> Vec<Vec<EntityId>> {
    // Despawned or unplaceable entities have no cell and sort first
    let mut groups: BTreeMap<Option<CellKey>, Vec<EntityId>> = BTreeMap::new();
    let index = snapshot.index();

    for &id in pool {
        let cell = snapshot
            .entity(id)
            .filter(|record| record.position.is_finite())
            .map(|record| index.cell_of(record.position.x, record.position.z));
        groups.entry(cell).or_default().push(id);
    }

    let mut parts = Vec::new();
    let mut current: Vec<EntityId> = Vec::new();

    for group in groups.into_values() {
        if !current.is_empty() && current.len() + group.len() > unit_size {
            parts.push(core::mem::take(&mut current));
        }

        if group.len() < unit_size {
            current.extend(group);
            continue;
        }

        // A crowded cell is split on its own
        for chunk in group.chunks(unit_size) {
            if chunk.len() == unit_size {
                parts.push(chunk.to_vec());
            } else {
                current.extend_from_slice(chunk);
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::host::HostFrame;
    use crate::record::{EntityCategory, EntityRecord, ObserverRecord, Vec3};
    use crate::snapshot::SnapshotStore;

    fn world(entities: u64, observers: u64) -> Arc<Snapshot> {
        let frame = HostFrame {
            entities: (0..entities)
                .map(|i| {
                    let x = ((i * 37) % 200) as f64 - 100.0;
                    let z = ((i * 91) % 200) as f64 - 100.0;
                    EntityRecord::new(EntityId(i), Vec3::new(x, 64.0, z), EntityCategory::Animal)
                })
                .collect(),
            observers: (0..observers)
                .map(|i| {
                    let x = (i as f64) * 20.0 - 40.0;
                    ObserverRecord::new(ObserverId(100 + i), Vec3::new(x, 64.0, 0.0), 60.0)
                })
                .collect(),
        };
        SnapshotStore::new()
            .publish(1, &frame, &BTreeMap::new(), Arc::default())
            .unwrap()
    }

    #[test]
    fn test_partition_completeness() {
        let snapshot = world(500, 5);
        let units = Partitioner::new(4).partition(&snapshot, 16);

        for view in snapshot.observers() {
            let id = view.record.id;
            let pool = snapshot.candidate_pool(id);

            let mut seen = Vec::new();
            for unit in units.iter().filter(|unit| unit.observer == id) {
                seen.extend_from_slice(&unit.entities);
            }
            let unique: BTreeSet<_> = seen.iter().copied().collect();

            assert_eq!(unique.len(), seen.len(), "duplicate candidates for {id}");
            assert_eq!(unique.into_iter().collect::<Vec<_>>(), pool);
        }
    }

    #[test]
    fn test_unit_ordering() {
        let snapshot = world(300, 4);
        let units = Partitioner::new(2).partition(&snapshot, 32);

        for (seq, unit) in units.iter().enumerate() {
            assert_eq!(unit.seq, seq);
            assert!(!unit.entities.is_empty());
            assert!(unit.entities.windows(2).all(|w| w[0] < w[1]));
        }

        for pair in units.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.observer <= b.observer);
            if a.observer == b.observer {
                assert!(a.entities[0] < b.entities[0]);
                assert_eq!(a.part + 1, b.part);
            }
        }
    }

    #[test]
    fn test_parts_count_matches() {
        let snapshot = world(400, 3);
        let units = Partitioner::new(1).partition(&snapshot, 24);

        for unit in &units {
            let siblings = units.iter().filter(|u| u.observer == unit.observer).count();
            assert_eq!(unit.parts as usize, siblings);
        }
    }

    #[test]
    fn test_unit_sizes_are_bounded() {
        let snapshot = world(1000, 2);
        let units = Partitioner::new(1).partition(&snapshot, 20);
        let total: usize = units.iter().map(|u| u.entities.len()).sum();
        let unit_size = total.div_ceil(20);

        assert!(units.iter().all(|u| u.entities.len() <= unit_size));
        assert!(units.len() >= total.div_ceil(unit_size));
        assert!(units.len() > 2);
    }

    #[test]
    fn test_crowded_cell_is_split() {
        // Every entity in one cell
        let frame = HostFrame {
            entities: (0..100)
                .map(|i| EntityRecord::new(EntityId(i), Vec3::new(1.0, 64.0, 1.0), EntityCategory::Item))
                .collect(),
            observers: vec![ObserverRecord::new(ObserverId(1), Vec3::new(0.0, 64.0, 0.0), 32.0)],
        };
        let snapshot = SnapshotStore::new()
            .publish(1, &frame, &BTreeMap::new(), Arc::default())
            .unwrap();

        let units = Partitioner::new(1).partition(&snapshot, 4);
        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| u.entities.len() == 25));
    }

    #[test]
    fn test_partition_is_deterministic() {
        let snapshot = world(250, 3);
        let partitioner = Partitioner::new(3);

        let first: Vec<_> = partitioner
            .partition(&snapshot, 12)
            .into_iter()
            .map(|u| (u.observer, u.part, u.entities))
            .collect();
        let second: Vec<_> = partitioner
            .partition(&snapshot, 12)
            .into_iter()
            .map(|u| (u.observer, u.part, u.entities))
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_world_yields_no_units() {
        let snapshot = world(0, 3);
        assert!(Partitioner::default().partition(&snapshot, 8).is_empty());
    }
}
