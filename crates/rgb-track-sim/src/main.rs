//! Entity tracking simulator
//!
//! This binary:
//! 1. Loads a tracker config (TOML file from `TRACKER_CONFIG`, or defaults)
//! 2. Starts one synthetic region per thread, each with its own engine
//! 3. Ticks every region at `TARGET_TPS` and logs per-tick reports
//!
//! Environment:
//! - `TRACKER_CONFIG` - path to a TOML tracker config
//! - `TARGET_TPS` - ticks per second (default 20)
//! - `REGIONS` - independent regions to run (default 2)
//! - `TICKS` - ticks per region before exiting (default 200)
//! - `ENTITIES` - entities per region (default 2000)
//! - `OBSERVERS` - observers per region (default 40)

mod world;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use rgb_track::prelude::*;
use tracing::{debug, info, warn};

use crate::world::{PacketCounter, SyntheticWorld};

/// Per-region totals reported at exit.
#[derive(Debug, Default)]
struct RegionSummary {
    ticks: u64,
    parallel: u64,
    synchronous: u64,
    skipped: u64,
    deferred: u64,
    failures: u64,
    slowest: Duration,
    packets: PacketCounter,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn load_config() -> eyre::Result<TrackerConfig> {
    let Ok(path) = std::env::var("TRACKER_CONFIG").map(PathBuf::from) else {
        info!("TRACKER_CONFIG not set; using default tracker config");
        return Ok(TrackerConfig::default());
    };

    let source = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let config = TrackerConfig::from_toml_str(&source)
        .wrap_err_with(|| format!("failed to load {}", path.display()))?;

    info!("Loaded tracker config from {}", path.display());
    Ok(config)
}

fn run_region(
    region: RegionId,
    config: TrackerConfig,
    ticks: u64,
    target_delta: Duration,
    mut world: SyntheticWorld,
) -> eyre::Result<RegionSummary> {
    let mut engine = TickCoordinator::new(region, config, Arc::new(AdmitAll))?;
    let mut summary = RegionSummary::default();

    for tick in 1..=ticks {
        let start = Instant::now();

        world.step();
        let report = engine.tick(tick, &world, &mut summary.packets);

        summary.ticks += 1;
        match report.mode {
            TickMode::Parallel => summary.parallel += 1,
            TickMode::Synchronous => summary.synchronous += 1,
            TickMode::Skipped => summary.skipped += 1,
        }
        summary.deferred += report.deferred_observers.len() as u64;
        summary.failures += report.diagnostics.len() as u64;
        summary.slowest = summary.slowest.max(report.elapsed);

        debug!(
            %region,
            tick,
            mode = ?report.mode,
            units = report.units,
            started = report.started,
            stopped = report.stopped,
            updated = report.updated,
            elapsed_us = report.elapsed.as_micros() as u64,
            "tick"
        );

        if !report.deferred_observers.is_empty() {
            warn!(
                %region,
                tick,
                deferred = ?report.deferred_observers,
                "observers missed the tracking deadline"
            );
        }

        if tick % 100 == 0 {
            info!(
                %region,
                tick,
                entities = world.entity_count(),
                spawns = summary.packets.spawns,
                despawns = summary.packets.despawns,
                moves = summary.packets.moves,
                "progress"
            );
        }

        // Sleep to maintain target tick rate
        let elapsed = start.elapsed();
        if elapsed < target_delta {
            thread::sleep(target_delta - elapsed);
        }
    }

    Ok(summary)
}

fn main() -> eyre::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rgb_track_sim=info".parse()?)
                .add_directive("rgb_track=info".parse()?),
        )
        .init();

    info!("Starting entity tracking simulator");

    let config = load_config()?;
    let target_tps: f64 = env_or("TARGET_TPS", 20.0);
    let regions: u32 = env_or("REGIONS", 2);
    let ticks: u64 = env_or("TICKS", 200);
    let entities: usize = env_or("ENTITIES", 2_000);
    let observers: usize = env_or("OBSERVERS", 40);

    if !(target_tps.is_finite() && target_tps > 0.0) {
        eyre::bail!("TARGET_TPS must be a positive number, got {target_tps}");
    }
    let target_delta = Duration::from_secs_f64(1.0 / target_tps);

    info!(
        regions,
        ticks,
        entities,
        observers,
        target_tps,
        workers = config.worker_count(),
        enabled = config.enabled,
        "simulation configured"
    );

    // Each region owns its engine and ticks on its own thread
    let mut handles = Vec::with_capacity(regions as usize);
    for index in 0..regions {
        let region = RegionId(index);
        let config = config.clone();
        let extent = (entities as f64).sqrt() * 3.0;
        let world = SyntheticWorld::new(u64::from(index), entities, observers, extent);

        let handle = thread::Builder::new()
            .name(format!("region-{index}"))
            .spawn(move || run_region(region, config, ticks, target_delta, world))
            .wrap_err("failed to spawn region thread")?;
        handles.push((region, handle));
    }

    for (region, handle) in handles {
        let summary = handle
            .join()
            .map_err(|_| eyre::eyre!("region {region} thread panicked"))??;

        info!(
            %region,
            ticks = summary.ticks,
            parallel = summary.parallel,
            synchronous = summary.synchronous,
            skipped = summary.skipped,
            deferred = summary.deferred,
            failures = summary.failures,
            slowest_us = summary.slowest.as_micros() as u64,
            spawns = summary.packets.spawns,
            despawns = summary.packets.despawns,
            moves = summary.packets.moves,
            "region finished"
        );
    }

    info!("Simulation complete");
    Ok(())
}
