//! Per-region tick coordination.
//!
//! # Tick Lifecycle
//!
//! ```text
//! Idle ─► SnapshotPublished ─► Dispatched ─► Awaiting ─► Draining ─► Applying ─► Idle
//!   │              │                 ▲
//!   │              └── sync path ────┘ (units evaluated inline, no wait)
//!   └── publish failed ─► Idle (tick skipped, tracked-sets untouched)
//! ```
//!
//! Only the apply phase touches live tracked-sets and only the tick thread
//! runs it. Everything before it reads the immutable snapshot, so a late or
//! failed unit can cost an observer one tick of freshness but never a
//! wrong tracked-set.
//!
//! An observer's deltas are applied only when every one of its units
//! reported. Otherwise the whole observer is deferred and re-evaluated from
//! its unchanged tracked-set next tick; applying part of an observer's work
//! could stop an entity whose matching start lives in the missing part.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, debug_span, info, trace, warn};

use crate::config::{TrackerConfig, TrackingRules};
use crate::delta::{ActionKind, Delta, Diagnostic, apply_delta};
use crate::error::{PoolError, TrackResult};
use crate::evaluate::evaluate_contained;
use crate::host::{HostState, TrackingSink, VisibilityFilter};
use crate::merge::{DeltaSender, MergeQueue, merge_queue};
use crate::partition::{Partitioner, WorkUnit};
use crate::pool::{Rejected, TickBatch, WorkerPool};
use crate::record::{ObserverId, RegionId, TrackedSet};
use crate::snapshot::SnapshotStore;

/// Ticks between attempts to bring back a dead pool, doubling per failure.
const RESTART_BACKOFF: u64 = 20;
const MAX_RESTART_BACKOFF: u64 = 1_200;

/// Where the coordinator is within a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TickPhase {
    #[default]
    Idle,
    SnapshotPublished,
    Dispatched,
    Awaiting,
    Draining,
    Applying,
}

/// How a tick's units were evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TickMode {
    /// Units ran on the worker pool under a deadline.
    Parallel,
    /// Units ran inline on the tick thread.
    Synchronous,
    /// No snapshot could be published; nothing was evaluated or applied.
    Skipped,
}

/// What one call to [`TickCoordinator::tick`] did.
#[derive(Clone, Debug)]
pub struct TickReport {
    pub tick: u64,
    pub mode: TickMode,
    /// Work units the partitioner produced.
    pub units: usize,
    /// Observers whose deltas were applied (including empty ones).
    pub applied_observers: usize,
    /// Observers whose units did not all report; their tracked-sets are
    /// unchanged this tick.
    pub deferred_observers: Vec<ObserverId>,
    pub started: usize,
    pub stopped: usize,
    pub updated: usize,
    /// Candidates skipped because evaluation failed.
    pub diagnostics: Vec<Diagnostic>,
    /// Deltas from earlier ticks found and dropped while draining.
    pub discarded: usize,
    pub elapsed: Duration,
}

impl TickReport {
    fn new(tick: u64, mode: TickMode) -> Self {
        Self {
            tick,
            mode,
            units: 0,
            applied_observers: 0,
            deferred_observers: Vec::new(),
            started: 0,
            stopped: 0,
            updated: 0,
            diagnostics: Vec::new(),
            discarded: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether every observer in the snapshot was applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.mode != TickMode::Skipped && self.deferred_observers.is_empty()
    }
}

/// Drives snapshot, partition, dispatch, drain and apply for one region.
pub struct TickCoordinator {
    region: RegionId,
    config: TrackerConfig,
    staged: Option<TrackerConfig>,
    rules: Arc<TrackingRules>,
    filter: Arc<dyn VisibilityFilter>,
    store: SnapshotStore,
    partitioner: Partitioner,
    pool: Option<WorkerPool>,
    workers: usize,
    merge: MergeQueue,
    sender: DeltaSender,
    tracked: BTreeMap<ObserverId, Arc<TrackedSet>>,
    phase: TickPhase,
    degraded: bool,
    /// Set by [`TickCoordinator::shutdown_pool`]; no automatic restarts.
    halted: bool,
    restart_at: u64,
    restart_backoff: u64,
}

impl TickCoordinator {
    /// Create a coordinator for `region`.
    ///
    /// If the worker pool cannot be started the coordinator still works; it
    /// just runs every tick synchronously.
    pub fn new(
        region: RegionId,
        config: TrackerConfig,
        filter: Arc<dyn VisibilityFilter>,
    ) -> TrackResult<Self> {
        config.validate()?;

        let (sender, merge) = merge_queue();
        let mut coordinator = Self {
            region,
            rules: Arc::new(TrackingRules::from_config(&config)),
            partitioner: Partitioner::new(config.min_unit_size),
            workers: config.worker_count(),
            config,
            staged: None,
            filter,
            store: SnapshotStore::new(),
            pool: None,
            merge,
            sender,
            tracked: BTreeMap::new(),
            phase: TickPhase::Idle,
            degraded: false,
            halted: false,
            restart_at: 0,
            restart_backoff: RESTART_BACKOFF,
        };
        coordinator.start_pool();

        Ok(coordinator)
    }

    #[must_use]
    pub fn region(&self) -> RegionId {
        self.region
    }

    #[must_use]
    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    /// The config in effect (not any staged one).
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The live tracked-set of an observer seen in the last applied tick.
    #[must_use]
    pub fn tracked(&self, observer: ObserverId) -> Option<&TrackedSet> {
        self.tracked.get(&observer).map(Arc::as_ref)
    }

    /// Observers with a live tracked-set, ascending.
    pub fn observers(&self) -> impl Iterator<Item = ObserverId> + '_ {
        self.tracked.keys().copied()
    }

    /// Whether the worker pool is up and healthy.
    #[must_use]
    pub fn pool_available(&self) -> bool {
        self.pool.as_ref().is_some_and(WorkerPool::is_available)
    }

    /// Stage a new config. It takes effect at the start of the next tick.
    pub fn reconfigure(&mut self, config: TrackerConfig) -> TrackResult<()> {
        config.validate()?;
        debug!(region = %self.region, "staged tracker config");
        self.staged = Some(config);
        Ok(())
    }

    /// Stop the worker pool. Later ticks run synchronously until a
    /// reconfigure rebuilds it.
    pub fn shutdown_pool(&mut self) {
        self.halted = true;
        if let Some(pool) = &mut self.pool {
            pool.shutdown();
        }
    }

    /// Run one tick's tracking work.
    ///
    /// `tick` must increase on every call. Never fails: every problem is
    /// reflected in the returned report and in the logs.
    pub fn tick<H, S>(&mut self, tick: u64, host: &H, sink: &mut S) -> TickReport
    where
        H: HostState + ?Sized,
        S: TrackingSink + ?Sized,
    {
        let started_at = Instant::now();
        let span = debug_span!("tracking_tick", region = %self.region, tick);
        let _enter = span.enter();

        self.apply_staged();
        self.revive_pool(tick);

        let snapshot = match self
            .store
            .publish(tick, host, &self.tracked, Arc::clone(&self.rules))
        {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "snapshot publish failed; skipping tracking this tick");
                let mut report = TickReport::new(tick, TickMode::Skipped);
                report.elapsed = started_at.elapsed();
                return report;
            }
        };
        self.set_phase(TickPhase::SnapshotPublished);

        let target = self.config.target_unit_count(self.workers);
        let units = self.partitioner.partition(&snapshot, target);

        let mut expected: BTreeMap<ObserverId, u32> = snapshot
            .observers()
            .map(|view| (view.record.id, 0))
            .collect();
        for unit in &units {
            expected.insert(unit.observer, unit.parts);
        }
        // Workers hold their own references; the tick thread is done reading
        drop(snapshot);

        let mode = self.choose_mode(units.len());
        let mut report = TickReport::new(tick, mode);
        report.units = units.len();

        match mode {
            TickMode::Parallel => self.run_parallel(tick, units, started_at),
            _ => self.run_inline(units),
        }

        self.set_phase(TickPhase::Draining);
        let mut grouped: BTreeMap<ObserverId, SmallVec<[Delta; 2]>> = BTreeMap::new();
        for delta in self.merge.drain() {
            if delta.tick == tick {
                grouped.entry(delta.observer).or_default().push(delta);
            } else {
                report.discarded += 1;
            }
        }
        if report.discarded > 0 {
            debug!(discarded = report.discarded, "dropped stale deltas");
        }

        self.set_phase(TickPhase::Applying);
        for (&observer, &parts) in &expected {
            let mut deltas = grouped.remove(&observer).unwrap_or_default();
            if deltas.len() != parts as usize {
                report.deferred_observers.push(observer);
                continue;
            }

            deltas.sort_unstable_by_key(|delta| delta.part);
            let mut actions = Vec::new();
            for delta in deltas {
                actions.extend(delta.actions);
                report.diagnostics.extend(delta.diagnostics);
            }

            for action in &actions {
                match action.kind {
                    ActionKind::StartTrack => report.started += 1,
                    ActionKind::StopTrack => report.stopped += 1,
                    ActionKind::Update => report.updated += 1,
                }
            }

            let live = self.tracked.entry(observer).or_default();
            if !actions.is_empty() {
                apply_delta(Arc::make_mut(live), &actions);
                sink.dispatch(observer, &actions);
            }
            report.applied_observers += 1;
        }

        // Observers gone from the host lose their state silently
        self.tracked.retain(|id, _| expected.contains_key(id));

        if !report.deferred_observers.is_empty() {
            warn!(
                deferred = report.deferred_observers.len(),
                "observers deferred to next tick"
            );
        }

        self.set_phase(TickPhase::Idle);
        report.elapsed = started_at.elapsed();

        debug!(
            mode = ?report.mode,
            units = report.units,
            applied = report.applied_observers,
            started = report.started,
            stopped = report.stopped,
            updated = report.updated,
            failures = report.diagnostics.len(),
            elapsed_us = report.elapsed.as_micros() as u64,
            "tracking tick complete"
        );

        report
    }

    fn run_inline(&mut self, units: Vec<WorkUnit>) {
        self.set_phase(TickPhase::Dispatched);
        for unit in units {
            if let Some(delta) = evaluate_contained(&unit, self.filter.as_ref()) {
                self.sender.push(delta);
            }
        }
    }

    fn run_parallel(&mut self, tick: u64, units: Vec<WorkUnit>, started_at: Instant) {
        let Some(pool) = &self.pool else {
            self.run_inline(units);
            return;
        };

        let batch = Arc::new(TickBatch::new(tick, units.len()));
        let mut inline = 0_usize;

        for unit in units {
            if let Err(Rejected { error, unit }) = pool.submit(unit, &batch) {
                trace!(%error, seq = unit.seq, "running rejected unit inline");
                if let Some(delta) = evaluate_contained(&unit, self.filter.as_ref()) {
                    self.sender.push(delta);
                }
                batch.complete_one();
                inline += 1;
            }
        }
        if inline > 0 {
            debug!(inline, "pool rejected units; ran them on the tick thread");
        }

        self.set_phase(TickPhase::Dispatched);
        self.set_phase(TickPhase::Awaiting);

        let deadline = started_at + self.config.deadline();
        if !batch.wait_until(deadline) {
            batch.abandon();
            warn!(
                remaining = batch.remaining(),
                deadline_ms = self.config.deadline().as_millis() as u64,
                "tracking deadline expired"
            );
        }
    }

    fn choose_mode(&mut self, units: usize) -> TickMode {
        if !self.config.enabled || units <= self.config.sequential_threshold {
            return TickMode::Synchronous;
        }

        let health = match &self.pool {
            Some(pool) => pool.health(),
            None => return TickMode::Synchronous,
        };

        match health {
            Ok(()) => {
                self.restart_backoff = RESTART_BACKOFF;
                if self.degraded {
                    info!("worker pool healthy again; resuming parallel tracking");
                    self.degraded = false;
                }
                TickMode::Parallel
            }
            Err(error) => {
                if !self.degraded {
                    warn!(%error, "worker pool unavailable; tracking synchronously");
                    self.degraded = true;
                }
                TickMode::Synchronous
            }
        }
    }

    fn apply_staged(&mut self) {
        let Some(config) = self.staged.take() else {
            return;
        };
        if config == self.config {
            return;
        }

        let rebuild = config.enabled != self.config.enabled
            || config.worker_threads != self.config.worker_threads
            || config.max_backlog != self.config.max_backlog;

        self.rules = Arc::new(TrackingRules::from_config(&config));
        self.partitioner = Partitioner::new(config.min_unit_size);
        self.workers = config.worker_count();
        self.config = config;

        if rebuild {
            // Stragglers from the old pool must not hold up this tick
            if let Some(pool) = self.pool.take() {
                pool.retire();
            }
            self.halted = false;
            self.restart_at = 0;
            self.restart_backoff = RESTART_BACKOFF;
            self.start_pool();
        }

        info!(
            region = %self.region,
            enabled = self.config.enabled,
            workers = self.workers,
            "applied tracker config"
        );
    }

    /// Replace a pool that never started or lost workers.
    ///
    /// Attempts are spaced by a backoff that doubles while they keep
    /// failing. A saturated pool is left alone; it drains by itself.
    fn revive_pool(&mut self, tick: u64) {
        if !self.config.enabled || self.halted || tick < self.restart_at {
            return;
        }

        let dead = match &self.pool {
            None => true,
            Some(pool) => matches!(pool.health(), Err(PoolError::WorkersLost { .. })),
        };
        if !dead {
            return;
        }

        if let Some(pool) = self.pool.take() {
            pool.retire();
        }
        self.restart_at = tick.saturating_add(self.restart_backoff);
        self.restart_backoff = (self.restart_backoff * 2).min(MAX_RESTART_BACKOFF);

        info!(region = %self.region, next_attempt = self.restart_at, "restarting tracking worker pool");
        self.start_pool();
    }

    fn start_pool(&mut self) {
        if !self.config.enabled {
            return;
        }

        match WorkerPool::new(
            self.workers,
            self.region,
            self.config.max_backlog,
            self.sender.clone(),
            Arc::clone(&self.filter),
        ) {
            Ok(pool) => {
                self.pool = Some(pool);
                self.degraded = false;
            }
            Err(error) => {
                warn!(region = %self.region, %error, "could not start worker pool; tracking synchronously");
                self.degraded = true;
            }
        }
    }

    fn set_phase(&mut self, phase: TickPhase) {
        trace!(from = ?self.phase, to = ?phase, "tick phase");
        self.phase = phase;
    }
}

impl core::fmt::Debug for TickCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TickCoordinator")
            .field("region", &self.region)
            .field("phase", &self.phase)
            .field("observers", &self.tracked.len())
            .field("pool", &self.pool)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl Drop for TickCoordinator {
    fn drop(&mut self) {
        self.shutdown_pool();
    }
}
