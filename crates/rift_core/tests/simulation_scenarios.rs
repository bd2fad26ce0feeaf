//! # Simulation Scenario Tests
//!
//! End-to-end runs through [`Simulation::step`]:
//!
//! 1. **Collapse**: a growing rift drives a dimension through `Unstable`
//!    and `Collapsing` to `Collapsed`; its entities land in the fallback
//! 2. **Recovery**: a collapse countdown is cancelled when the rift decays,
//!    including a partial recovery that stays below the warning band
//! 3. **Matchmaking**: a party that fits nowhere times out at the cap
//! 4. **Cancellation**: a cancelled invocation never resolves
//! 5. **Determinism**: identical inputs give identical digests and events,
//!    whatever the worker count
//!
//! Run with: cargo test --test simulation_scenarios -- --nocapture

use std::sync::Arc;

use rift_core::manager::Location;
use rift_core::{
    AbilityId, Catalog, Dimension, DimensionId, DimensionKind, DimensionState, EntityId, EntityProfile,
    MatchmakingOutcome, Position, Rejection, RiftSpec, SessionId, SimConfig, SimEvent, Simulation,
};

const SHIPPED_CATALOG: &str = include_str!("../data/catalog.toml");

const STRIKE_ONLY: &str = r#"
    [[abilities]]
    id = 1
    name = "strike"
    cost = 10
    cooldown_ticks = 2
    base_power = 10
    pattern = { type = "Single" }
    kind = { type = "Strike" }
"#;

fn quiet_config() -> SimConfig {
    let mut config = SimConfig::default();
    config.workers.effect_threads = 1;
    config.combat.crit_chance_pct = 0;
    config.stability.effect_density_weight = 0.0;
    config.stability.entity_load_weight = 0.0;
    config.stability.collapse_countdown_ms = 100;
    config
}

fn simulation(config: SimConfig, catalog: &str) -> Simulation {
    let catalog = Catalog::from_toml_str(catalog).expect("test catalog is valid");
    Simulation::new(config, Arc::new(catalog)).expect("test config is valid")
}

fn populate(sim: &mut Simulation, kind: DimensionKind, count: usize) -> (DimensionId, Vec<EntityId>) {
    let manager = sim.manager_mut();
    let dim = manager.create_dimension(kind).expect("under the cap");
    let profile = EntityProfile::default();
    let entities = (0..count)
        .map(|i| {
            manager
                .spawn_entity(dim, Position::new(i as f32, 0.0), &profile)
                .expect("room")
        })
        .collect();
    (dim, entities)
}

fn open_rift(sim: &mut Simulation, dim: DimensionId, impact: f32, growth_per_tick: f32, duration_ticks: u32) {
    let spec = RiftSpec { impact, radius: 2.0, growth_per_tick, duration_ticks };
    sim.manager_mut()
        .get_mut(dim)
        .expect("live")
        .open_rift(&spec, Position::new(0.0, 0.0));
}

fn transitions(events: &[SimEvent], of: DimensionId) -> Vec<DimensionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SimEvent::DimensionStateChanged { dimension, to, .. } if *dimension == of => Some(*to),
            _ => None,
        })
        .collect()
}

// ============================================================================
// COLLAPSE AND RECOVERY
// ============================================================================

#[test]
fn test_growing_rift_collapses_and_evacuates() {
    let mut sim = simulation(quiet_config(), STRIKE_ONLY);
    let (dim, entities) = populate(&mut sim, DimensionKind::Void, 3);
    let fallback = sim.manager().fallback();
    let countdown = sim.config().collapse_countdown_ticks();
    open_rift(&mut sim, dim, 0.75, 0.01, 10_000);

    let mut events = Vec::new();
    let mut collapsing_at = None;
    let mut collapsed_at = None;
    for _ in 0..40 {
        let report = sim.step();
        if transitions(&report.events, dim).contains(&DimensionState::Collapsing { remaining_ticks: countdown }) {
            collapsing_at = Some(report.tick);
        }
        if report.collapsed.contains(&dim) {
            collapsed_at = Some(report.tick);
        }
        events.extend(report.events);
    }

    let first_stability = events.iter().find_map(|e| match e {
        SimEvent::DimensionStateChanged { dimension, stability, .. } if *dimension == dim => Some(*stability),
        _ => None,
    });
    assert!(first_stability.is_some_and(|s| s > 0.2 && s < 0.25));

    assert_eq!(
        transitions(&events, dim),
        vec![
            DimensionState::Unstable,
            DimensionState::Collapsing { remaining_ticks: countdown },
            DimensionState::Collapsed,
        ]
    );
    // The full grace window elapses before evacuation.
    let (Some(start), Some(end)) = (collapsing_at, collapsed_at) else {
        panic!("expected a countdown and a collapse, got {collapsing_at:?} and {collapsed_at:?}");
    };
    assert_eq!(end - start, countdown);
    assert!(sim.manager().get(dim).is_none());

    for entity in &entities {
        assert_eq!(sim.manager().locate(*entity), Some(Location::In(fallback)));
    }
    let migrated = events
        .iter()
        .filter(|e| matches!(e, SimEvent::EntityMigrated { from, to, .. } if *from == dim && *to == fallback))
        .count();
    assert_eq!(migrated, 3);
    assert_eq!(sim.metrics().collapses, 1);
    assert!(events.iter().any(|e| matches!(e, SimEvent::RiftClosed { dimension, .. } if *dimension == dim)));
}

#[test]
fn test_decaying_rift_cancels_collapse() {
    let mut sim = simulation(quiet_config(), STRIKE_ONLY);
    let (dim, entities) = populate(&mut sim, DimensionKind::Physical, 3);
    open_rift(&mut sim, dim, 0.85, 0.0, 3);

    let mut events = Vec::new();
    for _ in 0..20 {
        events.extend(sim.step().events);
    }

    let states = transitions(&events, dim);
    assert!(matches!(states.as_slice(), [DimensionState::Collapsing { .. }, DimensionState::Stable]));

    let dimension = sim.manager().get(dim).expect("still live");
    assert_eq!(dimension.state(), DimensionState::Stable);
    assert_eq!(dimension.entity_count(), entities.len());
    assert!(dimension.rifts().is_empty());
    assert_eq!(sim.metrics().collapses, 0);
}

#[test]
fn test_partial_recovery_cancels_collapse() {
    let mut sim = simulation(quiet_config(), STRIKE_ONLY);
    let (dim, entities) = populate(&mut sim, DimensionKind::Astral, 2);
    let countdown = sim.config().collapse_countdown_ticks();
    assert!(countdown > 2);

    // A lasting 0.65 base plus a short rift growing 0.1 -> 0.205, gone on tick 5.
    open_rift(&mut sim, dim, 0.65, 0.0, 10_000);
    open_rift(&mut sim, dim, 0.065, 0.035, 5);

    let mut reports = Vec::new();
    for _ in 0..5 {
        reports.push(sim.step());
    }

    let changes: Vec<(u64, DimensionState, DimensionState, f32)> = reports
        .iter()
        .flat_map(|report| {
            report.events.iter().filter_map(move |e| match e {
                SimEvent::DimensionStateChanged { dimension, from, to, stability } if *dimension == dim => {
                    Some((report.tick, *from, *to, *stability))
                }
                _ => None,
            })
        })
        .collect();
    assert_eq!(changes.len(), 3, "{changes:?}");

    let (first, second, third) = (changes[0], changes[1], changes[2]);
    assert_eq!((first.1, first.2), (DimensionState::Initializing, DimensionState::Unstable));
    assert!((first.3 - 0.25).abs() < 1e-3);

    assert_eq!(
        (second.1, second.2),
        (DimensionState::Unstable, DimensionState::Collapsing { remaining_ticks: countdown })
    );
    assert_eq!(second.0 - first.0, 2);
    assert!((second.3 - 0.18).abs() < 1e-3);

    // One tick of countdown has run by the time recovery lands.
    assert!(matches!(third.1, DimensionState::Collapsing { remaining_ticks } if remaining_ticks == countdown - 1));
    assert_eq!(third.2, DimensionState::Stable);
    assert_eq!(third.0 - second.0, 2);
    assert!((third.3 - 0.35).abs() < 1e-3);

    let dimension = sim.manager().get(dim).expect("still live");
    assert_eq!(dimension.state(), DimensionState::Stable);
    assert_eq!(dimension.rifts().len(), 1);
    assert_eq!(dimension.entity_count(), entities.len());
    assert_eq!(sim.metrics().collapses, 0);
}

#[test]
fn test_fallback_never_collapses() {
    let mut sim = simulation(quiet_config(), STRIKE_ONLY);
    let fallback = sim.manager().fallback();
    open_rift(&mut sim, fallback, 1.5, 0.0, 10_000);

    let mut events = Vec::new();
    for _ in 0..30 {
        events.extend(sim.step().events);
    }

    assert_eq!(transitions(&events, fallback), vec![DimensionState::Unstable]);
    let dimension = sim.manager().get(fallback).expect("fallback is permanent");
    assert_eq!(dimension.stability(), 0.0);
}

// ============================================================================
// MATCHMAKING
// ============================================================================

#[test]
fn test_party_times_out_at_dimension_cap() {
    let mut config = quiet_config();
    config.dimensions.max_concurrent = 2;
    config.dimensions.entity_capacity = 8;
    config.matchmaking.timeout_ms = 100;
    let mut sim = simulation(config, STRIKE_ONLY);
    let handle = sim.handle();

    let first = handle.request_match(SessionId(1), 4, None).expect("open");
    let second = handle.request_match(SessionId(2), 5, None).expect("open");

    let mut outcomes = Vec::new();
    for _ in 0..20 {
        outcomes.extend(sim.step().matchmaking);
    }

    assert!(outcomes.iter().any(|o| matches!(
        o,
        MatchmakingOutcome::Admitted { ticket, entities, .. } if *ticket == first && entities.len() == 4
    )));
    let timed_out: Vec<&MatchmakingOutcome> = outcomes
        .iter()
        .filter(|o| matches!(o, MatchmakingOutcome::TimedOut { .. }))
        .collect();
    assert_eq!(
        timed_out,
        vec![&MatchmakingOutcome::TimedOut {
            ticket: second,
            session: SessionId(2),
            rejection: Rejection::MatchmakingTimedOut { ticket: second, session: SessionId(2) },
        }]
    );
    assert_eq!(sim.manager().len(), 2);
    assert_eq!(sim.matchmaking_queue_len(), 0);
    assert_eq!(sim.metrics().timeouts, 1);
}

#[test]
fn test_cancelled_match_is_never_admitted() {
    let mut sim = simulation(quiet_config(), STRIKE_ONLY);
    let handle = sim.handle();
    let ticket = handle.request_match(SessionId(9), 2, None).expect("open");
    handle.cancel_match(ticket).expect("open");

    let report = sim.step();
    assert!(report.matchmaking.is_empty());
    assert_eq!(sim.matchmaking_queue_len(), 0);
    assert_eq!(sim.manager().len(), 1);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancelled_invocation_never_resolves() {
    let mut sim = simulation(quiet_config(), STRIKE_ONLY);
    let (dim, entities) = populate(&mut sim, DimensionKind::Physical, 2);
    let handle = sim.handle();

    let cancelled = handle.invoke(entities[0], AbilityId(1), vec![entities[1]], dim).expect("open");
    let kept = handle.invoke(entities[1], AbilityId(1), vec![entities[0]], dim).expect("open");
    assert!(handle.cancel(cancelled));

    let report = sim.step();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.resolutions.len(), 1);
    assert_eq!(report.resolutions[0].invocation, kept);

    let dimension = sim.manager().get(dim).expect("live");
    assert_eq!(dimension.entity(entities[1]).expect("present").health.current, 100);
    assert_eq!(dimension.entity(entities[0]).expect("present").health.current, 90);

    // Already dispatched: too late to cancel.
    assert!(!handle.cancel(kept));
    assert_eq!(sim.metrics().cancellations, 1);
}

// ============================================================================
// DETERMINISM
// ============================================================================

fn scripted_run(threads: usize) -> (Vec<u64>, Vec<SimEvent>) {
    let mut config = SimConfig { seed: 0x5EED, ..SimConfig::default() };
    config.workers.effect_threads = threads;
    let mut sim = simulation(config, SHIPPED_CATALOG);

    let abilities: Vec<AbilityId> = sim.catalog().abilities().map(|a| a.id).collect();
    let kinds = [DimensionKind::Physical, DimensionKind::Void, DimensionKind::Celestial];
    let mut cast = Vec::new();
    for kind in kinds.iter().cycle().take(4) {
        cast.push(populate(&mut sim, *kind, 6));
    }

    let handle = sim.handle();
    let mut events = Vec::new();
    for tick in 0..150_usize {
        for (dim, members) in &cast {
            for (i, caster) in members.iter().enumerate() {
                let ability = abilities[(tick + i) % abilities.len()];
                let target = members[(i + 1) % members.len()];
                handle.invoke(*caster, ability, vec![target], *dim).expect("open");
            }
        }
        events.extend(sim.step().events);
    }

    let digests = sim.manager().iter().map(Dimension::digest).collect();
    (digests, events)
}

#[test]
fn test_same_inputs_same_outcome() {
    let (digests_a, events_a) = scripted_run(1);
    let (digests_b, events_b) = scripted_run(1);
    assert_eq!(digests_a, digests_b);
    assert_eq!(events_a, events_b);
    assert!(events_a.iter().any(|e| matches!(e, SimEvent::AbilityResolved { .. })));
}

#[test]
fn test_worker_count_does_not_change_outcome() {
    let (digests_inline, events_inline) = scripted_run(1);
    let (digests_pooled, events_pooled) = scripted_run(4);
    assert_eq!(digests_inline, digests_pooled);
    assert_eq!(events_inline, events_pooled);
}
