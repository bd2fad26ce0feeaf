//! # Chaos Benchmark
//!
//! Runs a fixed population through a fixed number of ticks with fault
//! injection on, then checks the world survived intact.
//!
//! - Rift storms push dimensions toward collapse
//! - Stalls force tick overruns
//! - Migration squeezes force deferred evacuation
//!
//! Ticks are stepped back to back, so the numbers measure simulation cost
//! rather than the wall-clock schedule.

use clap::Parser;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rift_core::{
    resolve_layered, AbilityId, Catalog, DimensionId, DimensionKind, DimensionState, EntityId, Environment,
    Position, SimEvent, Simulation, TargetPattern,
};

const DEFAULT_CONFIG: &str = include_str!("../../data/sim.toml");
const DEFAULT_CATALOG: &str = include_str!("../../data/catalog.toml");

/// Side of the square entities spawn in.
const ARENA_EXTENT: f32 = 24.0;

/// Benchmark parameters.
#[derive(Parser, Debug)]
#[command(name = "chaos_benchmark", about = "Fault-injection soak of the rift simulation")]
struct Args {
    /// Ticks to run.
    #[arg(long, default_value_t = 3_600)]
    ticks: u64,

    /// Regular dimensions created up front.
    #[arg(long, default_value_t = 12)]
    dimensions: usize,

    /// Entities spawned per dimension.
    #[arg(long, default_value_t = 24)]
    population: usize,

    /// Invocations submitted per dimension per tick.
    #[arg(long, default_value_t = 2)]
    casts: usize,

    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Seed for world, traffic and chaos.
    #[arg(long, default_value_t = 0x00C4_A05E)]
    seed: u64,
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    sorted[(sorted.len() * pct / 100).min(sorted.len() - 1)]
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let mut config = resolve_layered(DEFAULT_CONFIG, Environment::Qa)?.config;
    config.seed = args.seed;
    config.chaos.enabled = true;
    config.chaos.seed = args.seed.rotate_left(17);
    config.workers.effect_threads = args.threads;
    config.dimensions.max_concurrent = config.dimensions.max_concurrent.max(args.dimensions + 1);
    config.dimensions.entity_capacity = config.dimensions.entity_capacity.max(args.population);
    config.dimensions.fallback_capacity = config
        .dimensions
        .fallback_capacity
        .max(args.dimensions * args.population);

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                 RIFT CHAOS BENCHMARK                             ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("Configuration:");
    println!("  Ticks:         {}", args.ticks);
    println!("  Dimensions:    {}", args.dimensions);
    println!("  Population:    {} per dimension", args.population);
    println!("  Casts:         {} per dimension per tick", args.casts);
    println!("  Threads:       {}", args.threads);
    println!("  Storm chance:  {:.3}", config.chaos.rift_storm_chance);
    println!("  Stall chance:  {:.3} ({}ms)", config.chaos.stall_chance, config.chaos.stall_ms);
    println!("  Squeeze:       {:.3}", config.chaos.sync_squeeze_chance);
    println!();

    let catalog = Arc::new(Catalog::from_toml_str(DEFAULT_CATALOG)?);
    let abilities: Vec<(AbilityId, TargetPattern)> = catalog.abilities().map(|a| (a.id, a.pattern)).collect();
    let mut sim = Simulation::new(config, Arc::clone(&catalog))?;
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);

    // === WORLD SETUP ===
    let kinds = [DimensionKind::Physical, DimensionKind::Void, DimensionKind::Celestial];
    let mut roster: BTreeMap<DimensionId, Vec<EntityId>> = BTreeMap::new();
    for i in 0..args.dimensions {
        let kind = kinds[i % kinds.len()];
        let dimension = sim.manager_mut().create_dimension(kind)?;
        let profile = catalog.stats().profile_for(kind);
        for _ in 0..args.population {
            let position = Position::new(rng.gen_range(0.0..ARENA_EXTENT), rng.gen_range(0.0..ARENA_EXTENT));
            let entity = sim.manager_mut().spawn_entity(dimension, position, profile)?;
            roster.entry(dimension).or_default().push(entity);
        }
    }
    let spawned = args.dimensions * args.population;

    // === RUN ===
    let handle = sim.handle();
    let outbound = sim.events();
    let mut tick_us = Vec::with_capacity(usize::try_from(args.ticks).unwrap_or_default());
    let mut collapsed = Vec::new();
    let mut submitted = 0_u64;
    let started = Instant::now();

    for _ in 0..args.ticks {
        for (&dimension, members) in &roster {
            for _ in 0..args.casts {
                let (Some(&caster), Some(&(ability, pattern))) = (members.choose(&mut rng), abilities.choose(&mut rng))
                else {
                    continue;
                };
                let targets: Vec<EntityId> = match pattern {
                    TargetPattern::SelfOnly => Vec::new(),
                    TargetPattern::Single | TargetPattern::Area { .. } => {
                        members.choose(&mut rng).copied().into_iter().collect()
                    }
                    TargetPattern::Multi { max_targets } => members
                        .choose_multiple(&mut rng, usize::from(max_targets))
                        .copied()
                        .collect(),
                };
                handle.invoke(caster, ability, targets, dimension)?;
                submitted += 1;
            }
        }

        let report = sim.step();
        tick_us.push(report.duration.as_micros() as u64);
        outbound.try_iter().for_each(drop);

        for event in &report.events {
            if let SimEvent::EntityMigrated { entity, from, to } = event {
                if let Some(members) = roster.get_mut(from) {
                    members.retain(|e| e != entity);
                }
                roster.entry(*to).or_default().push(*entity);
            }
        }
        for dimension in &report.collapsed {
            roster.remove(dimension);
        }
        roster.retain(|_, members| !members.is_empty());
        collapsed.extend(report.collapsed);
    }
    let elapsed = started.elapsed();

    // === FINAL REPORT ===
    let metrics = *sim.metrics();
    let chaos = sim.chaos_stats().unwrap_or_default();
    let placed: usize = sim.manager().iter().map(rift_core::Dimension::entity_count).sum();
    let in_transit = sim.manager().pending_migrations();
    let fallback_state = sim
        .manager()
        .get(sim.manager().fallback())
        .map_or(DimensionState::Collapsed, rift_core::Dimension::state);

    tick_us.sort_unstable();
    let avg_us = if tick_us.is_empty() { 0 } else { tick_us.iter().sum::<u64>() / tick_us.len() as u64 };

    println!();
    println!("┌─ Tick Cost ──────────────────────────────────────────────────────┐");
    println!("│ Min:     {:10} us", tick_us.first().copied().unwrap_or_default());
    println!("│ Avg:     {avg_us:10} us");
    println!("│ P50:     {:10} us", percentile(&tick_us, 50));
    println!("│ P99:     {:10} us", percentile(&tick_us, 99));
    println!("│ Max:     {:10} us", tick_us.last().copied().unwrap_or_default());
    println!("│ Wall:    {:10.2} s", elapsed.as_secs_f64());
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ Combat ─────────────────────────────────────────────────────────┐");
    println!("│ Submitted:        {submitted:10}");
    println!("│ Resolved:         {:10}", metrics.resolutions);
    println!("│ Rejected:         {:10} ({:.1}%)", metrics.rejections, metrics.rejection_rate() * 100.0);
    println!("│ Effects applied:  {:10}", metrics.effects_applied);
    println!("│ Effects expired:  {:10}", metrics.effects_expired);
    println!("│ Effects dropped:  {:10}", metrics.effects_dropped);
    println!("│ At ceiling:       {:10}", metrics.capacity_rejections);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ Chaos ──────────────────────────────────────────────────────────┐");
    println!("│ Rift storms:      {:10}", chaos.storms);
    println!("│ Stalls:           {:10}", chaos.stalls);
    println!("│ Squeezes:         {:10}", chaos.squeezes);
    println!("│ Collapses:        {:10}", collapsed.len());
    println!("│ Migrations:       {:10}", metrics.migrations);
    println!("│ Deferred sync:    {:10}", metrics.deferred_effect_updates);
    println!("│ Dropped events:   {:10}", metrics.dropped_events);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let conserved = placed + in_transit == spawned;
    let fallback_ok = fallback_state != DimensionState::Collapsed;

    println!("╔══════════════════════════════════════════════════════════════════╗");
    if conserved && fallback_ok {
        println!("║  ✓ CHAOS SURVIVED");
    } else {
        println!("║  ✗ CHAOS BROKE THE WORLD");
    }
    println!(
        "║    Entities:  {placed} placed + {in_transit} in transit / {spawned} spawned {}",
        if conserved { "✓" } else { "✗" }
    );
    println!("║    Fallback:  {fallback_state:?} {}", if fallback_ok { "✓" } else { "✗" });
    println!("╚══════════════════════════════════════════════════════════════════╝");

    if conserved && fallback_ok {
        Ok(())
    } else {
        Err("world invariants violated".into())
    }
}
