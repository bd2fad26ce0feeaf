//! # Tick Scheduler
//!
//! The authoritative loop. One [`Simulation`] owns every dimension and
//! advances them together.
//!
//! ## Tick Order
//!
//! ```text
//! 1. Drain invocations (arrival order, cancelled ones skipped) and
//!    session requests; route invocations by caster
//! 2. Per dimension, on the worker pool:
//!    a. Combat resolution (plan against snapshot, commit in order)
//!    b. Effect timers (budgeted, round-robin)
//!    c. Rift growth and decay
//!    d. Stability + state machine, collapse countdown, evacuation
//! 3. Serial, in arena order: evacuees to the migration queue, collapsed
//!    dimensions released, migrations within the sync budget
//! 4. Matchmaking admission and timeouts
//! 5. Events published, metrics published
//! ```
//!
//! The network loop runs separately and turns tracked changes into
//! [`StateDelta`]s for a [`BroadcastSink`].

pub mod handle;
pub mod tick;

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::Catalog;
use crate::chaos::ChaosInjector;
use crate::combat::{AbilityInvocation, CombatResolver, Resolution};
use crate::config::SimConfig;
use crate::delta::{BroadcastSink, StateDelta};
use crate::dimension::{Dimension, DimensionState};
use crate::entity::Entity;
use crate::error::{ConfigResult, RejectionResult};
use crate::events::{EventChannel, RiftCloseCause, SimEvent, TickEvent};
use crate::ids::{DimensionId, Tick};
use crate::manager::{evacuate, DimensionManager, MigrationReport};
use crate::matchmaking::{MatchmakingOutcome, MatchmakingQueue};
use crate::metrics::{SharedMetrics, SimMetrics};
use crate::pipeline::EffectPipeline;
use crate::stability::{StabilityWeights, Thresholds};

pub use handle::SubmitHandle;
pub use tick::{TickLoop, TickPoll, TickStats};

use handle::{Inbox, SessionRequest};

/// Floor of the adaptive effect-update budget.
pub const MIN_EFFECT_BUDGET: usize = 16;

/// Capacity of the outbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 65_536;

/// Everything one simulation tick did.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    /// Tick number.
    pub tick: Tick,
    /// Invocation results: routing rejections first, then per dimension in
    /// arena order, each in arrival order.
    pub resolutions: Vec<Resolution>,
    /// Matchmaking results.
    pub matchmaking: Vec<MatchmakingOutcome>,
    /// Events in publication order.
    pub events: Vec<SimEvent>,
    /// Invocations cancelled before dispatch.
    pub cancelled: usize,
    /// Entity effect-timer updates carried to the next tick.
    pub deferred_effect_updates: usize,
    /// Largest number of effect-timer updates done in one dimension.
    pub peak_effect_updates: usize,
    /// Migration work.
    pub migrations: MigrationReport,
    /// Dimensions that collapsed and were released.
    pub collapsed: Vec<DimensionId>,
    /// Wall-clock cost.
    pub duration: Duration,
}

/// Read-only inputs shared by every dimension of a tick.
struct TickContext<'a> {
    catalog: &'a Catalog,
    config: &'a SimConfig,
    weights: StabilityWeights,
    thresholds: Thresholds,
    countdown_ticks: u64,
    max_chain_depth: u32,
    effect_budget: usize,
    tick: Tick,
}

/// Result of one dimension's share of a tick.
struct DimensionTick {
    dimension: DimensionId,
    resolutions: Vec<Resolution>,
    events: Vec<SimEvent>,
    processed: usize,
    deferred: usize,
    evacuees: Option<Vec<Entity>>,
}

/// Runs one tick of a single dimension. Touches nothing outside it.
fn tick_dimension(dim: &mut Dimension, invocations: Vec<AbilityInvocation>, ctx: &TickContext<'_>) -> DimensionTick {
    let pipeline = EffectPipeline::new(ctx.catalog, ctx.max_chain_depth);
    let resolver = CombatResolver::new(ctx.catalog, &ctx.config.combat, pipeline);
    let dimension = dim.id();
    let mut events = Vec::new();

    let resolutions = if invocations.is_empty() {
        Vec::new()
    } else {
        resolver.resolve_tick(dim, invocations, ctx.tick, &mut events)
    };

    let advance = pipeline.advance(dim, ctx.effect_budget, &mut events);

    events.extend(dim.advance_rifts().into_iter().map(|rift| SimEvent::RiftClosed {
        dimension,
        rift,
        cause: RiftCloseCause::Decayed,
    }));

    let mut entered_collapse = false;
    if dim.needs_evaluation() {
        let pressure = pipeline.destabilization(dim);
        if let Some((from, to)) = dim.evaluate(pressure, &ctx.weights, &ctx.thresholds, ctx.countdown_ticks) {
            tracing::info!(%dimension, ?from, ?to, stability = dim.stability(), "dimension state changed");
            events.push(SimEvent::DimensionStateChanged { dimension, from, to, stability: dim.stability() });
            entered_collapse = matches!(to, DimensionState::Collapsing { .. });
        }
    }

    // The countdown starts on the tick after the dimension enters `Collapsing`.
    let evacuees = (!entered_collapse && dim.tick_countdown()).then(|| evacuate(dim, &pipeline, &mut events));

    DimensionTick {
        dimension,
        resolutions,
        events,
        processed: advance.processed,
        deferred: advance.deferred,
        evacuees,
    }
}

/// The simulation: dimensions, queues, and the loops that drive them.
pub struct Simulation {
    catalog: Arc<Catalog>,
    config: SimConfig,
    manager: DimensionManager,
    matchmaking: MatchmakingQueue,
    tick: Tick,
    inbox: Inbox,
    handle: SubmitHandle,
    events: EventChannel<TickEvent>,
    /// Events raised between ticks (teardown), published with the next tick.
    pending_events: Vec<SimEvent>,
    /// Last deltas of released dimensions, sent on the next network tick.
    final_deltas: Vec<StateDelta>,
    metrics: SimMetrics,
    shared_metrics: SharedMetrics,
    pool: Option<rayon::ThreadPool>,
    chaos: Option<ChaosInjector>,
}

impl Simulation {
    /// Builds a simulation with its fallback dimension.
    ///
    /// # Errors
    ///
    /// Returns the validation error of an inconsistent config.
    pub fn new(config: SimConfig, catalog: Arc<Catalog>) -> ConfigResult<Self> {
        config.validate()?;

        let threads = config.workers.effect_threads.max(1);
        let pool = if threads > 1 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("rift-dimension-{i}"))
                .build()
                .map_err(|error| tracing::warn!(%error, "worker pool unavailable, ticking dimensions inline"))
                .ok()
        } else {
            None
        };
        let chaos = config.chaos.enabled.then(|| ChaosInjector::new(&config.chaos));
        let (submit, inbox) = handle::channel();

        tracing::info!(
            simulation_hz = config.tick.simulation_hz,
            network_hz = config.tick.network_hz,
            workers = threads,
            chaos = chaos.is_some(),
            "simulation ready"
        );

        Ok(Self {
            manager: DimensionManager::new(&config.dimensions, config.seed),
            matchmaking: MatchmakingQueue::new(config.matchmaking_timeout_ticks()),
            catalog,
            tick: 0,
            inbox,
            handle: submit,
            events: EventChannel::new(EVENT_CHANNEL_CAPACITY),
            pending_events: Vec::new(),
            final_deltas: Vec::new(),
            metrics: SimMetrics::default(),
            shared_metrics: SharedMetrics::default(),
            pool,
            chaos,
            config,
        })
    }

    /// A new submission handle.
    #[must_use]
    pub fn handle(&self) -> SubmitHandle {
        self.handle.clone()
    }

    /// Receiver of the outbound event stream.
    #[must_use]
    pub fn events(&self) -> crossbeam_channel::Receiver<TickEvent> {
        self.events.receiver()
    }

    /// Current counters.
    #[inline]
    #[must_use]
    pub const fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Shared snapshot, refreshed after every tick.
    #[must_use]
    pub fn shared_metrics(&self) -> SharedMetrics {
        Arc::clone(&self.shared_metrics)
    }

    /// Last completed tick.
    #[inline]
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Configuration in use.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Static content in use.
    #[inline]
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The dimension manager.
    #[inline]
    #[must_use]
    pub const fn manager(&self) -> &DimensionManager {
        &self.manager
    }

    /// The dimension manager, for setup between ticks.
    #[inline]
    pub fn manager_mut(&mut self) -> &mut DimensionManager {
        &mut self.manager
    }

    /// Queued matchmaking tickets.
    #[inline]
    #[must_use]
    pub fn matchmaking_queue_len(&self) -> usize {
        self.matchmaking.len()
    }

    /// Fault injection totals, when chaos is on.
    #[must_use]
    pub fn chaos_stats(&self) -> Option<crate::chaos::ChaosStats> {
        self.chaos.as_ref().map(|c| *c.stats())
    }

    /// Evacuates and releases a dimension between ticks.
    ///
    /// Its events go out with the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Rejection::UnknownDimension`] for stale ids and
    /// [`crate::Rejection::InvalidTarget`] for the fallback dimension.
    pub fn teardown(&mut self, id: DimensionId) -> RejectionResult<()> {
        let pipeline = EffectPipeline::new(&self.catalog, self.config.max_chain_depth());
        let mut released = self.manager.teardown(id, &pipeline, &mut self.pending_events)?;
        self.final_deltas.push(StateDelta::capture(&mut released, self.tick));
        tracing::info!(dimension = %id, "dimension torn down");
        Ok(())
    }

    /// Runs one simulation tick with the configured effect budget.
    pub fn step(&mut self) -> TickReport {
        self.step_with_budget(self.config.tick.max_effect_updates_per_tick)
    }

    fn step_with_budget(&mut self, effect_budget: usize) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        let tick = self.tick;
        self.inbox.begin_tick(tick);

        let mut report = TickReport { tick, ..TickReport::default() };
        let mut events = std::mem::take(&mut self.pending_events);

        // 1. Intake.
        let drained = self.inbox.drain_invocations();
        report.cancelled = drained.cancelled;
        self.metrics.cancellations += drained.cancelled as u64;

        let mut buckets: BTreeMap<DimensionId, Vec<AbilityInvocation>> = BTreeMap::new();
        for invocation in drained.invocations {
            match self.manager.route(&invocation) {
                Ok(dimension) => buckets.entry(dimension).or_default().push(invocation),
                Err(reason) => {
                    tracing::debug!(invocation = invocation.id.0, caster = %invocation.caster, %reason, "invocation not routed");
                    events.push(SimEvent::AbilityRejected {
                        invocation: invocation.id,
                        caster: invocation.caster,
                        ability: invocation.ability,
                        reason: reason.clone(),
                    });
                    report.resolutions.push(Resolution::rejected(&invocation, reason));
                }
            }
        }

        for request in self.inbox.drain_sessions() {
            match request {
                SessionRequest::Join(request) => {
                    let (ticket, session) = (request.ticket, request.session);
                    if let Err(rejection) = self.matchmaking.enqueue(request, tick) {
                        tracing::debug!(ticket = ticket.0, %rejection, "matchmaking request refused");
                        report.matchmaking.push(MatchmakingOutcome::Refused { ticket, session, rejection });
                    }
                }
                SessionRequest::Leave(ticket) => {
                    if self.matchmaking.cancel(ticket) {
                        tracing::debug!(ticket = ticket.0, "matchmaking ticket withdrawn");
                    }
                }
            }
        }

        // 2. Per-dimension work.
        let ctx = TickContext {
            catalog: &self.catalog,
            config: &self.config,
            weights: StabilityWeights::from(&self.config.stability),
            thresholds: Thresholds::from(&self.config.stability),
            countdown_ticks: self.config.collapse_countdown_ticks(),
            max_chain_depth: self.config.max_chain_depth(),
            effect_budget: effect_budget.max(1),
            tick,
        };
        let work: Vec<(&mut Dimension, Vec<AbilityInvocation>)> = self
            .manager
            .iter_mut()
            .map(|dim| {
                let invocations = buckets.remove(&dim.id()).unwrap_or_default();
                (dim, invocations)
            })
            .collect();
        let results: Vec<DimensionTick> = match &self.pool {
            Some(pool) => pool.install(|| {
                work.into_par_iter()
                    .map(|(dim, invocations)| tick_dimension(dim, invocations, &ctx))
                    .collect()
            }),
            None => work
                .into_iter()
                .map(|(dim, invocations)| tick_dimension(dim, invocations, &ctx))
                .collect(),
        };

        // 3. Cross-dimension handoff.
        let mut collapsed = Vec::new();
        for result in results {
            report.resolutions.extend(result.resolutions);
            events.extend(result.events);
            report.deferred_effect_updates += result.deferred;
            report.peak_effect_updates = report.peak_effect_updates.max(result.processed);
            if let Some(evacuees) = result.evacuees {
                self.manager.enqueue_evacuees(result.dimension, evacuees);
                collapsed.push(result.dimension);
            }
        }
        for id in &collapsed {
            if let Some(mut dim) = self.manager.release(*id) {
                self.final_deltas.push(StateDelta::capture(&mut dim, tick));
            }
        }
        report.collapsed = collapsed;
        self.metrics.deferred_effect_updates += report.deferred_effect_updates as u64;

        let roll = self.chaos.as_mut().map(ChaosInjector::roll).unwrap_or_default();
        let mut migration_budget = self.config.migrations_per_tick();
        if roll.squeeze {
            migration_budget = (migration_budget / 2).max(1);
        }
        report.migrations = self.manager.process_migrations(migration_budget, &mut events);
        self.metrics.deferred_migrations += report.migrations.deferred as u64;

        // 4. Matchmaking.
        let outcomes = self.matchmaking.process(&mut self.manager, self.catalog.stats(), tick, &mut events);
        report.matchmaking.extend(outcomes);

        if let Some(chaos) = self.chaos.as_mut() {
            if roll.storm {
                chaos.rift_storm(&mut self.manager, &mut events);
            }
            if let Some(stall) = roll.stall {
                tracing::warn!(stall_ms = stall.as_millis() as u64, "chaos: stalling tick");
                std::thread::sleep(stall);
            }
        }

        // 5. Publish.
        for event in &events {
            self.metrics.observe(event);
            if self.events.try_send(TickEvent { tick, event: event.clone() }).is_err() {
                self.metrics.dropped_events += 1;
            }
        }
        report.events = events;
        report.duration = started.elapsed();

        self.metrics.ticks += 1;
        self.metrics.record_tick_duration(report.duration);
        self.metrics.publish(&self.shared_metrics);

        tracing::trace!(
            tick,
            dimensions = self.manager.len(),
            resolutions = report.resolutions.len(),
            events = report.events.len(),
            deferred = report.deferred_effect_updates,
            elapsed_us = report.duration.as_micros() as u64,
            "tick complete"
        );
        report
    }

    /// Runs one network tick: every dimension with changes since the last
    /// broadcast produces a delta. Returns the number of deltas sent.
    pub fn broadcast<S: BroadcastSink + ?Sized>(&mut self, sink: &mut S) -> usize {
        let mut sent = 0;
        for delta in self.final_deltas.drain(..) {
            sink.broadcast(&delta);
            sent += 1;
        }
        let tick = self.tick;
        for dim in self.manager.iter_mut() {
            if dim.tracker.has_changes() {
                sink.broadcast(&StateDelta::capture(dim, tick));
                sent += 1;
            }
        }
        self.metrics.deltas_broadcast += sent as u64;
        sent
    }

    /// Drives both loops on the wall clock for `duration`.
    ///
    /// The effect-update budget adapts: an overrun halves it (down to
    /// [`MIN_EFFECT_BUDGET`]), each on-time tick doubles it back toward the
    /// configured value.
    pub fn run<S: BroadcastSink + ?Sized>(&mut self, duration: Duration, sink: &mut S) -> SimMetrics {
        let start = Instant::now();
        let deadline = start + duration;
        let mut simulation = TickLoop::starting_at(self.config.simulation_tick(), start);
        let mut network = TickLoop::starting_at(self.config.network_tick(), start);
        let configured = self.config.tick.max_effect_updates_per_tick.max(MIN_EFFECT_BUDGET);
        let mut budget = configured;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let mut idle = deadline - now;

            match simulation.poll(now) {
                TickPoll::Due { skipped } => {
                    idle = Duration::ZERO;
                    self.metrics.skipped_ticks += skipped;
                    let tick_start = Instant::now();
                    let report = self.step_with_budget(budget);
                    if simulation.end_tick(tick_start) {
                        self.metrics.overruns += 1;
                        budget = (budget.min(report.peak_effect_updates) / 2).max(MIN_EFFECT_BUDGET);
                        tracing::warn!(
                            tick = report.tick,
                            elapsed_us = report.duration.as_micros() as u64,
                            budget_us = simulation.tick_duration().as_micros() as u64,
                            effect_budget = budget,
                            "simulation tick overrun"
                        );
                    } else if budget < configured {
                        budget = budget.saturating_mul(2).min(configured);
                    }
                    self.metrics.publish(&self.shared_metrics);
                }
                TickPoll::NotDue(left) => idle = idle.min(left),
            }

            match network.poll(Instant::now()) {
                TickPoll::Due { .. } => {
                    idle = Duration::ZERO;
                    let network_start = Instant::now();
                    self.broadcast(sink);
                    if network.end_tick(network_start) {
                        tracing::warn!(tick = self.tick, "network tick overrun");
                    }
                }
                TickPoll::NotDue(left) => idle = idle.min(left),
            }

            if !idle.is_zero() {
                std::thread::sleep(idle);
            }
        }

        tracing::info!(
            ticks = self.metrics.ticks,
            overruns = self.metrics.overruns,
            skipped = self.metrics.skipped_ticks,
            "run finished"
        );
        self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKind;
    use crate::entity::{EntityProfile, Position};
    use crate::ids::{AbilityId, EntityId, SessionId};

    const CATALOG: &str = r#"
        [[abilities]]
        id = 1
        name = "strike"
        cost = 10
        cooldown_ticks = 2
        base_power = 10
        pattern = { type = "Single" }
        kind = { type = "Strike" }
    "#;

    fn simulation(threads: usize) -> Simulation {
        let mut config = SimConfig::default();
        config.workers.effect_threads = threads;
        config.combat.crit_chance_pct = 0;
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        Simulation::new(config, Arc::new(catalog)).unwrap()
    }

    fn pair(sim: &mut Simulation) -> (DimensionId, EntityId, EntityId) {
        let manager = sim.manager_mut();
        let dim = manager.create_dimension(DimensionKind::Physical).unwrap();
        let profile = EntityProfile::default();
        let a = manager.spawn_entity(dim, Position::new(0.0, 0.0), &profile).unwrap();
        let b = manager.spawn_entity(dim, Position::new(1.0, 0.0), &profile).unwrap();
        (dim, a, b)
    }

    #[test]
    fn test_invocation_resolves_next_tick() {
        let mut sim = simulation(1);
        let (dim, a, b) = pair(&mut sim);
        let handle = sim.handle();
        handle.invoke(a, AbilityId(1), vec![b], dim).unwrap();

        let report = sim.step();
        assert_eq!(report.resolutions.len(), 1);
        assert!(report.resolutions[0].result.is_ok());
        assert_eq!(sim.manager().get(dim).unwrap().entity(b).unwrap().health.current, 90);
        assert_eq!(sim.metrics().resolutions, 1);
    }

    #[test]
    fn test_routing_rejects_wrong_dimension() {
        let mut sim = simulation(1);
        let (_, a, b) = pair(&mut sim);
        let fallback = sim.manager().fallback();
        sim.handle().invoke(a, AbilityId(1), vec![b], fallback).unwrap();

        let report = sim.step();
        assert!(matches!(
            report.resolutions[0].result,
            Err(crate::Rejection::InvalidTarget { target: Some(caster), .. }) if caster == a
        ));
    }

    #[test]
    fn test_events_are_published_with_tick() {
        let mut sim = simulation(1);
        let (dim, a, b) = pair(&mut sim);
        let events = sim.events();
        sim.handle().invoke(a, AbilityId(1), vec![b], dim).unwrap();
        sim.step();

        let published: Vec<TickEvent> = events.try_iter().collect();
        assert!(published.iter().all(|e| e.tick == 1));
        assert!(published.iter().any(|e| matches!(e.event, SimEvent::AbilityResolved { .. })));
    }

    #[test]
    fn test_parallel_matches_inline() {
        let run = |threads| {
            let mut sim = simulation(threads);
            let mut pairs = Vec::new();
            for _ in 0..6 {
                pairs.push(pair(&mut sim));
            }
            let handle = sim.handle();
            for round in 0..10 {
                for &(dim, a, b) in &pairs {
                    let (caster, target) = if round % 2 == 0 { (a, b) } else { (b, a) };
                    handle.invoke(caster, AbilityId(1), vec![target], dim).unwrap();
                }
                sim.step();
            }
            sim.manager().iter().map(Dimension::digest).collect::<Vec<_>>()
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn test_broadcast_only_changed_dimensions() {
        let mut sim = simulation(1);
        let (dim, a, b) = pair(&mut sim);
        let mut sink: Vec<StateDelta> = Vec::new();

        sim.step();
        assert_eq!(sim.broadcast(&mut sink), 2);
        sink.clear();

        sim.step();
        assert_eq!(sim.broadcast(&mut sink), 0);

        sim.handle().invoke(a, AbilityId(1), vec![b], dim).unwrap();
        sim.step();
        assert_eq!(sim.broadcast(&mut sink), 1);
        assert_eq!(sink[0].dimension, dim);
    }

    #[test]
    fn test_matchmaking_through_handle() {
        let mut sim = simulation(1);
        let handle = sim.handle();
        let ticket = handle.request_match(SessionId(5), 3, Some(DimensionKind::Void)).unwrap();
        let empty = handle.request_match(SessionId(6), 0, None).unwrap();

        let report = sim.step();
        assert!(report.matchmaking.iter().any(|o| matches!(
            o,
            MatchmakingOutcome::Refused { ticket: t, .. } if *t == empty
        )));
        let admitted = report.matchmaking.iter().find_map(|o| match o {
            MatchmakingOutcome::Admitted { ticket: t, dimension, entities, .. } if *t == ticket => {
                Some((*dimension, entities.len()))
            }
            _ => None,
        });
        let (dimension, party) = admitted.unwrap();
        assert_eq!(party, 3);
        assert_eq!(sim.manager().get(dimension).unwrap().kind(), DimensionKind::Void);
    }
}
