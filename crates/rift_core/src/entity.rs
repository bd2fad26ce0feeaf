//! # Entities
//!
//! Combatants living inside a dimension. An entity knows which dimension
//! holds it only by id; the dimension owns the entity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::effect::EffectInstance;
use crate::ids::{AbilityId, DimensionId, EffectTemplateId, EntityId, Tick};

/// 2D position inside a dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
}

impl Position {
    /// Creates a position.
    #[inline]
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[inline]
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A bounded resource pool (health, energy).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Current value.
    pub current: u32,
    /// Maximum value.
    pub max: u32,
}

impl Pool {
    /// A full pool.
    #[inline]
    #[must_use]
    pub const fn full(max: u32) -> Self {
        Self { current: max, max }
    }

    /// Removes up to `amount`, returning what was actually removed.
    pub fn drain(&mut self, amount: u32) -> u32 {
        let drained = amount.min(self.current);
        self.current -= drained;
        drained
    }

    /// Adds up to `amount` without exceeding max, returning what was added.
    pub fn restore(&mut self, amount: u32) -> u32 {
        let restored = amount.min(self.max - self.current);
        self.current += restored;
        restored
    }

    /// Returns true when the pool is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.current == 0
    }
}

/// Combat stats read by the damage formula.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatStats {
    /// Offensive rating.
    pub attack: u32,
    /// Defensive rating.
    pub defense: u32,
    /// Ability mastery in percent bonus.
    pub mastery: u32,
}

/// Stat-table row used to spawn an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityProfile {
    /// Maximum health.
    pub health: u32,
    /// Maximum energy.
    pub energy: u32,
    /// Energy regained per effect tick.
    #[serde(default)]
    pub energy_regen: u32,
    /// Combat stats.
    #[serde(default)]
    pub stats: CombatStats,
    /// Effect templates this entity is immune to.
    #[serde(default)]
    pub immunities: Vec<EffectTemplateId>,
}

impl Default for EntityProfile {
    fn default() -> Self {
        Self {
            health: 100,
            energy: 100,
            energy_regen: 1,
            stats: CombatStats::default(),
            immunities: Vec::new(),
        }
    }
}

/// A combatant.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    /// Entity id.
    pub id: EntityId,
    /// Back-reference to the owning dimension (lookup only).
    pub dimension: DimensionId,
    /// Position.
    pub position: Position,
    /// Health pool.
    pub health: Pool,
    /// Energy pool, paid for abilities.
    pub energy: Pool,
    /// Energy regained per effect tick.
    pub energy_regen: u32,
    /// Combat stats.
    pub stats: CombatStats,
    /// Static immunities.
    pub immunities: BTreeSet<EffectTemplateId>,
    /// Active effects, in application order.
    pub effects: Vec<EffectInstance>,
    /// Tick at which each ability becomes ready again.
    pub cooldowns: BTreeMap<AbilityId, Tick>,
}

impl Entity {
    /// Spawns an entity from a stat-table profile.
    #[must_use]
    pub fn from_profile(
        id: EntityId,
        dimension: DimensionId,
        position: Position,
        profile: &EntityProfile,
    ) -> Self {
        Self {
            id,
            dimension,
            position,
            health: Pool::full(profile.health),
            energy: Pool::full(profile.energy),
            energy_regen: profile.energy_regen,
            stats: profile.stats,
            immunities: profile.immunities.iter().copied().collect(),
            effects: Vec::new(),
            cooldowns: BTreeMap::new(),
        }
    }

    /// Returns true while health is above zero.
    #[inline]
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        !self.health.is_empty()
    }

    /// Ticks until `ability` is ready (0 if ready).
    #[must_use]
    pub fn cooldown_remaining(&self, ability: AbilityId, tick: Tick) -> u64 {
        self.cooldowns
            .get(&ability)
            .map_or(0, |&ready_at| ready_at.saturating_sub(tick))
    }

    /// Finds the active instance of `template`.
    #[must_use]
    pub fn effect(&self, template: EffectTemplateId) -> Option<&EffectInstance> {
        self.effects.iter().find(|e| e.template == template)
    }
}
