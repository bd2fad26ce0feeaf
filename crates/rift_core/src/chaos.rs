//! # Chaos Injection
//!
//! Seeded fault injection for soak runs. Each tick the injector may:
//!
//! - open a rift storm in one live regular dimension
//! - stall the tick thread to force an overrun
//! - halve the migration budget to force deferred sync
//!
//! The injector has its own RNG; dimension RNGs are never drawn from, so
//! combat rolls are the same with chaos on or off.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

use crate::ability::RiftSpec;
use crate::config::ChaosConfig;
use crate::entity::Position;
use crate::events::SimEvent;
use crate::ids::DimensionId;
use crate::manager::DimensionManager;

/// Lifetime of a storm rift.
const STORM_RIFT_TICKS: u32 = 120;
/// Radius of a storm rift.
const STORM_RIFT_RADIUS: f32 = 3.0;
/// Storm rifts land inside this square.
const STORM_EXTENT: f32 = 32.0;

/// Faults picked for one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChaosRoll {
    /// Open a rift storm.
    pub storm: bool,
    /// Sleep this long inside the tick.
    pub stall: Option<Duration>,
    /// Halve the migration budget.
    pub squeeze: bool,
}

/// Injected fault totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Rift storms opened.
    pub storms: u64,
    /// Stalls injected.
    pub stalls: u64,
    /// Migration budgets halved.
    pub squeezes: u64,
}

/// Seeded fault injector.
pub struct ChaosInjector {
    config: ChaosConfig,
    rng: ChaCha8Rng,
    stats: ChaosStats,
}

impl ChaosInjector {
    /// Creates an injector from its config section.
    #[must_use]
    pub fn new(config: &ChaosConfig) -> Self {
        Self {
            config: config.clone(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            stats: ChaosStats::default(),
        }
    }

    /// Injected fault totals.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    /// Picks this tick's faults. Always draws the same number of values.
    pub fn roll(&mut self) -> ChaosRoll {
        let storm = self.chance(self.config.rift_storm_chance);
        let stall = self.chance(self.config.stall_chance);
        let squeeze = self.chance(self.config.sync_squeeze_chance);

        if stall {
            self.stats.stalls += 1;
        }
        if squeeze {
            self.stats.squeezes += 1;
        }
        ChaosRoll {
            storm,
            stall: stall.then(|| Duration::from_millis(self.config.stall_ms)),
            squeeze,
        }
    }

    /// Opens a storm in a random live regular dimension.
    ///
    /// Returns the dimension hit, or `None` when there is no candidate.
    pub fn rift_storm(&mut self, manager: &mut DimensionManager, events: &mut Vec<SimEvent>) -> Option<DimensionId> {
        let candidates: Vec<DimensionId> = manager
            .iter()
            .filter(|d| !d.is_fallback() && d.state().is_live())
            .map(|d| d.id())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let dimension = candidates[self.rng.gen_range(0..candidates.len())];

        let spec = RiftSpec {
            impact: self.config.rift_storm_impact,
            radius: STORM_RIFT_RADIUS,
            growth_per_tick: 0.0,
            duration_ticks: STORM_RIFT_TICKS,
        };
        let positions: Vec<Position> = (0..self.config.rift_storm_size)
            .map(|_| Position::new(self.rng.gen_range(0.0..STORM_EXTENT), self.rng.gen_range(0.0..STORM_EXTENT)))
            .collect();

        let dim = manager.get_mut(dimension)?;
        for position in positions {
            let rift = dim.open_rift(&spec, position);
            events.push(SimEvent::RiftOpened { dimension, rift, impact: spec.impact });
        }
        self.stats.storms += 1;
        tracing::warn!(%dimension, rifts = self.config.rift_storm_size, "chaos: rift storm");
        Some(dimension)
    }

    fn chance(&mut self, probability: f32) -> bool {
        self.rng.gen::<f32>() < probability
    }
}
