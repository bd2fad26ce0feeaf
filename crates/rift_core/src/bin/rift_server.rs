//! # Rift Server
//!
//! Runs the authoritative simulation against synthetic traffic.
//!
//! ## Usage
//!
//! ```bash
//! rift_server --env dev --seconds 30 --sessions 12
//! RUST_LOG=rift_core=debug rift_server --config data/sim.toml
//! ```

use clap::Parser;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rift_core::{
    load_layered, resolve_layered, AbilityId, BroadcastSink, Catalog, DimensionId, DimensionKind, EntityId,
    Environment, SessionId, SimEvent, StateDelta, SubmitHandle, TargetPattern, TickEvent,
};

const DEFAULT_CONFIG: &str = include_str!("../../data/sim.toml");
const DEFAULT_CATALOG: &str = include_str!("../../data/catalog.toml");

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "rift_server", about = "Dimensional combat simulation server")]
struct Args {
    /// Layered config file (built-in defaults when omitted).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Content catalog (built-in catalog when omitted).
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Environment layer to resolve.
    #[arg(long, default_value = "dev")]
    env: Environment,

    /// Wall-clock run time.
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Synthetic sessions requesting matches at startup.
    #[arg(long, default_value_t = 8)]
    sessions: u64,
}

/// Encodes every delta and logs its size.
#[derive(Default)]
struct LoggingSink {
    deltas: u64,
    bytes: u64,
}

impl BroadcastSink for LoggingSink {
    fn broadcast(&mut self, delta: &StateDelta) {
        let bytes = delta.encode();
        self.deltas += 1;
        self.bytes += bytes.len() as u64;
        tracing::debug!(
            dimension = %delta.dimension,
            tick = delta.tick,
            state = ?delta.state,
            stability = delta.stability,
            entities = delta.entity_updates.len(),
            rifts = delta.rifts.len(),
            bytes = bytes.len(),
            "delta"
        );
    }
}

/// Where the traffic generator believes each entity is.
#[derive(Default)]
struct Roster {
    by_dimension: BTreeMap<DimensionId, Vec<EntityId>>,
}

impl Roster {
    fn observe(&mut self, event: &SimEvent) {
        match event {
            SimEvent::MatchmakingAdmitted { dimension, entities, .. } => {
                self.by_dimension.entry(*dimension).or_default().extend(entities);
            }
            SimEvent::EntityMigrated { entity, from, to } => {
                if let Some(members) = self.by_dimension.get_mut(from) {
                    members.retain(|e| e != entity);
                }
                self.by_dimension.entry(*to).or_default().push(*entity);
            }
            _ => {}
        }
        self.by_dimension.retain(|_, members| !members.is_empty());
    }
}

fn spawn_traffic(
    handle: SubmitHandle,
    events: crossbeam_channel::Receiver<TickEvent>,
    abilities: Vec<(AbilityId, TargetPattern)>,
    sessions: u64,
    seed: u64,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let kinds = [DimensionKind::Physical, DimensionKind::Void, DimensionKind::Celestial];
        for session in 0..sessions {
            let preferred = kinds.choose(&mut rng).copied();
            if handle.request_match(SessionId(session), rng.gen_range(2..=6), preferred).is_err() {
                return 0;
            }
        }

        let mut roster = Roster::default();
        let mut submitted = 0;
        while running.load(Ordering::Relaxed) {
            for TickEvent { event, .. } in events.try_iter() {
                roster.observe(&event);
            }

            for (&dimension, members) in &roster.by_dimension {
                let (Some(&caster), Some(&(ability, pattern))) = (members.choose(&mut rng), abilities.choose(&mut rng))
                else {
                    continue;
                };
                let targets = match pattern {
                    TargetPattern::SelfOnly => Vec::new(),
                    TargetPattern::Single | TargetPattern::Area { .. } => {
                        members.choose(&mut rng).copied().into_iter().collect()
                    }
                    TargetPattern::Multi { max_targets } => members
                        .choose_multiple(&mut rng, usize::from(max_targets))
                        .copied()
                        .collect(),
                };
                if handle.invoke(caster, ability, targets, dimension).is_err() {
                    return submitted;
                }
                submitted += 1;
            }
            thread::sleep(Duration::from_millis(16));
        }
        submitted
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let resolved = match &args.config {
        Some(path) => load_layered(path, args.env)?,
        None => resolve_layered(DEFAULT_CONFIG, args.env)?,
    };
    let catalog = match &args.catalog {
        Some(path) => Catalog::load(path)?,
        None => Catalog::from_toml_str(DEFAULT_CATALOG)?,
    };
    tracing::info!(
        env = %resolved.environment,
        conflicts = resolved.conflicts.len(),
        abilities = catalog.abilities().count(),
        seconds = args.seconds,
        "starting rift server"
    );

    let abilities: Vec<(AbilityId, TargetPattern)> = catalog.abilities().map(|a| (a.id, a.pattern)).collect();
    let seed = resolved.config.seed;
    let mut sim = rift_core::Simulation::new(resolved.config, Arc::new(catalog))?;

    let running = Arc::new(AtomicBool::new(true));
    let traffic = spawn_traffic(sim.handle(), sim.events(), abilities, args.sessions, seed, Arc::clone(&running));

    let mut sink = LoggingSink::default();
    let metrics = sim.run(Duration::from_secs(args.seconds), &mut sink);

    running.store(false, Ordering::Relaxed);
    let submitted = traffic.join().unwrap_or_default();

    tracing::info!(
        ticks = metrics.ticks,
        submitted,
        resolutions = metrics.resolutions,
        rejections = metrics.rejections,
        effects_applied = metrics.effects_applied,
        collapses = metrics.collapses,
        admissions = metrics.admissions,
        timeouts = metrics.timeouts,
        overruns = metrics.overruns,
        skipped = metrics.skipped_ticks,
        deltas = sink.deltas,
        delta_bytes = sink.bytes,
        max_tick_us = metrics.max_tick_us,
        "server stopped"
    );
    Ok(())
}
