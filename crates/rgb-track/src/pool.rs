//! Fixed-size worker pool for unit evaluation.
//!
//! Workers are plain OS threads fed over a crossbeam channel. Each one
//! evaluates a unit against its snapshot, pushes the delta onto the merge
//! queue, and only then counts the unit off its [`TickBatch`]. The tick
//! thread waits on the batch with a hard deadline and never on a worker.
//!
//! ```text
//! tick thread ──submit──► [channel] ──► worker 0 ─┐
//!      │                           └──► worker 1 ─┼─push──► merge queue
//!      │                                          │
//!      └──wait_until(deadline) ◄── complete_one ──┘
//! ```
//!
//! A batch that misses its deadline is abandoned: workers skip its units
//! that have not started, and anything that still finishes late is dropped
//! by the coordinator because its tick no longer matches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::error::PoolError;
use crate::evaluate::evaluate_contained;
use crate::host::VisibilityFilter;
use crate::merge::DeltaSender;
use crate::partition::WorkUnit;
use crate::record::RegionId;

/// Completion latch for one tick's submitted units.
#[derive(Debug)]
pub struct TickBatch {
    tick: u64,
    remaining: Mutex<usize>,
    done: Condvar,
    abandoned: AtomicBool,
}

impl TickBatch {
    #[must_use]
    pub fn new(tick: u64, units: usize) -> Self {
        Self {
            tick,
            remaining: Mutex::new(units),
            done: Condvar::new(),
            abandoned: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Count one unit as finished, whether it produced a delta or not.
    pub fn complete_one(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every unit is finished or `deadline` passes.
    ///
    /// Returns true if the batch completed.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.done.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }

    /// Tell workers not to start any more of this batch's units.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Units not yet finished.
    #[must_use]
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

struct Job {
    unit: WorkUnit,
    batch: Arc<TickBatch>,
}

#[derive(Debug, Default)]
struct PoolShared {
    /// Units submitted but not yet picked up.
    backlog: AtomicUsize,
    /// Worker threads still running their loop.
    alive: AtomicUsize,
}

/// Decrements the live-worker count when a worker exits for any reason.
struct AliveGuard(Arc<PoolShared>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A unit the pool refused, handed back so the caller can run it inline.
#[derive(Debug)]
pub struct Rejected {
    pub error: PoolError,
    pub unit: WorkUnit,
}

/// Worker threads owned by one region's coordinator.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
    size: usize,
    max_backlog: usize,
    region: RegionId,
}

impl WorkerPool {
    /// Start `size` workers named `rgb-track-{region}-{n}`.
    pub fn new(
        size: usize,
        region: RegionId,
        max_backlog: usize,
        deltas: DeltaSender,
        filter: Arc<dyn VisibilityFilter>,
    ) -> Result<Self, PoolError> {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(PoolShared::default());

        let mut pool = Self {
            sender: Some(sender),
            handles: Vec::with_capacity(size),
            shared,
            size,
            max_backlog,
            region,
        };

        for index in 0..size {
            let receiver = receiver.clone();
            let deltas = deltas.clone();
            let filter = Arc::clone(&filter);
            let shared = Arc::clone(&pool.shared);

            shared.alive.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("rgb-track-{region}-{index}"))
                .spawn(move || {
                    let guard = AliveGuard(shared);
                    worker_loop(&receiver, &deltas, filter.as_ref(), &guard.0);
                });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    pool.shared.alive.fetch_sub(1, Ordering::AcqRel);
                    // Already-started workers are joined by Drop
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        info!(%region, workers = size, "tracking worker pool started");
        Ok(pool)
    }

    /// Number of worker threads the pool was started with.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Queue a unit for evaluation.
    ///
    /// On rejection the unit comes back untouched and nothing was counted
    /// against `batch`.
    pub fn submit(&self, unit: WorkUnit, batch: &Arc<TickBatch>) -> Result<(), Rejected> {
        let Some(sender) = &self.sender else {
            return Err(Rejected {
                error: PoolError::ShutDown,
                unit,
            });
        };

        let backlog = self.shared.backlog.load(Ordering::Acquire);
        if backlog >= self.max_backlog {
            return Err(Rejected {
                error: PoolError::Saturated {
                    backlog,
                    limit: self.max_backlog,
                },
                unit,
            });
        }

        self.shared.backlog.fetch_add(1, Ordering::AcqRel);
        let job = Job {
            unit,
            batch: Arc::clone(batch),
        };

        sender.send(job).map_err(|returned| {
            self.shared.backlog.fetch_sub(1, Ordering::AcqRel);
            Rejected {
                error: PoolError::ShutDown,
                unit: returned.into_inner().unit,
            }
        })
    }

    /// Whether the pool can take a full tick of work right now.
    pub fn health(&self) -> Result<(), PoolError> {
        if self.sender.is_none() {
            return Err(PoolError::ShutDown);
        }

        let alive = self.shared.alive.load(Ordering::Acquire);
        if alive < self.size {
            return Err(PoolError::WorkersLost {
                lost: self.size - alive,
                size: self.size,
            });
        }

        let backlog = self.shared.backlog.load(Ordering::Acquire);
        if backlog > self.max_backlog {
            return Err(PoolError::Saturated {
                backlog,
                limit: self.max_backlog,
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.health().is_ok()
    }

    /// Units queued but not yet picked up by a worker.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::Acquire)
    }

    /// Stop accepting work and join every worker.
    ///
    /// Workers finish the unit in hand; queued units of abandoned batches are
    /// skipped. Idempotent.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(region = %self.region, "tracking worker panicked during shutdown");
            }
        }

        info!(region = %self.region, "tracking worker pool stopped");
    }

    /// Stop accepting work without waiting for the workers.
    ///
    /// Workers still holding a unit finish it and exit on their own; the
    /// caller never blocks on them. Late deltas carry a stale tick.
    pub fn retire(mut self) {
        if self.sender.take().is_none() {
            return;
        }

        // Dropping a JoinHandle detaches its thread
        let detached = self.handles.len();
        self.handles.clear();
        info!(region = %self.region, detached, "tracking worker pool retired");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("region", &self.region)
            .field("size", &self.size)
            .field("alive", &self.shared.alive.load(Ordering::Relaxed))
            .field("backlog", &self.shared.backlog.load(Ordering::Relaxed))
            .field("running", &self.sender.is_some())
            .finish()
    }
}

fn worker_loop(
    receiver: &Receiver<Job>,
    deltas: &DeltaSender,
    filter: &dyn VisibilityFilter,
    shared: &PoolShared,
) {
    for Job { unit, batch } in receiver {
        shared.backlog.fetch_sub(1, Ordering::AcqRel);

        if batch.is_abandoned() {
            trace!(tick = batch.tick(), seq = unit.seq, "skipping unit of abandoned tick");
            drop(unit);
            batch.complete_one();
            continue;
        }

        if let Some(delta) = evaluate_contained(&unit, filter) {
            deltas.push(delta);
        }

        // Release the snapshot before signalling
        drop(unit);
        batch.complete_one();
    }

    debug!("tracking worker exiting");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::error::EvalError;
    use crate::host::{AdmitAll, HostFrame};
    use crate::merge::merge_queue;
    use crate::partition::Partitioner;
    use crate::record::{EntityCategory, EntityId, EntityRecord, ObserverId, ObserverRecord, Vec3};
    use crate::snapshot::SnapshotStore;

    fn units(tick: u64, count: u64) -> Vec<WorkUnit> {
        let frame = HostFrame {
            entities: (0..40)
                .map(|i| {
                    EntityRecord::new(EntityId(i), Vec3::new(i as f64, 64.0, 0.0), EntityCategory::Animal)
                })
                .collect(),
            observers: (0..count)
                .map(|i| ObserverRecord::new(ObserverId(i), Vec3::new(0.0, 64.0, 0.0), 64.0))
                .collect(),
        };
        let snapshot = SnapshotStore::new()
            .publish(tick, &frame, &BTreeMap::new(), Arc::default())
            .unwrap();
        Partitioner::new(1000).partition(&snapshot, 1)
    }

    #[test]
    fn test_batch_completes_before_deadline() {
        let (sender, mut queue) = merge_queue();
        let pool = WorkerPool::new(2, RegionId(0), 64, sender, Arc::new(AdmitAll)).unwrap();

        let work = units(1, 4);
        let batch = Arc::new(TickBatch::new(1, work.len()));
        for unit in work {
            pool.submit(unit, &batch).unwrap();
        }

        assert!(batch.wait_until(Instant::now() + Duration::from_secs(5)));
        assert_eq!(batch.remaining(), 0);

        let deltas = queue.drain();
        assert_eq!(deltas.len(), 4);
        assert!(deltas.iter().all(|d| d.tick == 1 && d.actions.len() == 40));
    }

    #[test]
    fn test_deadline_expires_on_slow_unit() {
        let slow = |_: &ObserverRecord, _: &EntityRecord| -> Result<bool, EvalError> {
            thread::sleep(Duration::from_millis(20));
            Ok(true)
        };
        let (sender, _queue) = merge_queue();
        let pool = WorkerPool::new(1, RegionId(0), 64, sender, Arc::new(slow)).unwrap();

        let work = units(1, 1);
        let batch = Arc::new(TickBatch::new(1, work.len()));
        for unit in work {
            pool.submit(unit, &batch).unwrap();
        }

        let started = Instant::now();
        assert!(!batch.wait_until(started + Duration::from_millis(30)));
        assert!(started.elapsed() < Duration::from_millis(500));
        batch.abandon();
    }

    #[test]
    fn test_abandoned_units_are_skipped() {
        let (sender, mut queue) = merge_queue();
        let pool = WorkerPool::new(2, RegionId(0), 64, sender, Arc::new(AdmitAll)).unwrap();

        let work = units(1, 3);
        let batch = Arc::new(TickBatch::new(1, work.len()));
        batch.abandon();
        for unit in work {
            pool.submit(unit, &batch).unwrap();
        }

        assert!(batch.wait_until(Instant::now() + Duration::from_secs(5)));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_workers_are_named_by_region() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&names);
        let record_name = move |_: &ObserverRecord, _: &EntityRecord| -> Result<bool, EvalError> {
            if let Some(name) = thread::current().name() {
                seen.lock().push(name.to_owned());
            }
            Ok(true)
        };

        let (sender, _queue) = merge_queue();
        let pool = WorkerPool::new(1, RegionId(7), 64, sender, Arc::new(record_name)).unwrap();
        let work = units(1, 1);
        let batch = Arc::new(TickBatch::new(1, work.len()));
        for unit in work {
            pool.submit(unit, &batch).unwrap();
        }
        assert!(batch.wait_until(Instant::now() + Duration::from_secs(5)));

        assert!(names.lock().iter().all(|name| name == "rgb-track-r7-0"));
        assert!(!names.lock().is_empty());
    }

    #[test]
    fn test_shutdown_rejects_work() {
        let (sender, _queue) = merge_queue();
        let mut pool = WorkerPool::new(2, RegionId(0), 64, sender, Arc::new(AdmitAll)).unwrap();
        assert!(pool.is_available());

        pool.shutdown();
        pool.shutdown();
        assert!(matches!(pool.health(), Err(PoolError::ShutDown)));

        let mut work = units(1, 1);
        let batch = Arc::new(TickBatch::new(1, 1));
        let rejected = pool.submit(work.remove(0), &batch).unwrap_err();
        assert!(matches!(rejected.error, PoolError::ShutDown));
        assert_eq!(rejected.unit.observer, ObserverId(0));
        assert_eq!(batch.remaining(), 1);
    }

    #[test]
    fn test_retire_does_not_wait_for_busy_worker() {
        let slow = |_: &ObserverRecord, _: &EntityRecord| -> Result<bool, EvalError> {
            thread::sleep(Duration::from_millis(20));
            Ok(true)
        };
        let (sender, mut queue) = merge_queue();
        let pool = WorkerPool::new(1, RegionId(0), 64, sender, Arc::new(slow)).unwrap();

        // 40 candidates at 20 ms each keep the worker busy for ~800 ms
        let work = units(1, 1);
        let batch = Arc::new(TickBatch::new(1, work.len()));
        for unit in work {
            pool.submit(unit, &batch).unwrap();
        }

        let started = Instant::now();
        pool.retire();
        assert!(started.elapsed() < Duration::from_millis(200));

        // The detached worker still finishes what it was given
        assert!(batch.wait_until(Instant::now() + Duration::from_secs(10)));
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn test_lost_worker_reports_unhealthy() {
        let (sender, _queue) = merge_queue();
        let pool = WorkerPool::new(2, RegionId(0), 64, sender, Arc::new(AdmitAll)).unwrap();

        pool.shared.alive.fetch_sub(1, Ordering::AcqRel);
        assert!(matches!(
            pool.health(),
            Err(PoolError::WorkersLost { lost: 1, size: 2 })
        ));
        assert!(!pool.is_available());

        pool.shared.alive.fetch_add(1, Ordering::AcqRel);
        assert!(pool.is_available());
    }

    #[test]
    fn test_saturated_pool_hands_unit_back() {
        let (sender, _queue) = merge_queue();
        let pool = WorkerPool::new(1, RegionId(0), 0, sender, Arc::new(AdmitAll)).unwrap();

        let mut work = units(1, 1);
        let batch = Arc::new(TickBatch::new(1, 1));
        let rejected = pool.submit(work.remove(0), &batch).unwrap_err();
        assert!(matches!(
            rejected.error,
            PoolError::Saturated { backlog: 0, limit: 0 }
        ));
    }
}
