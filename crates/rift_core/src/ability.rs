//! # Abilities
//!
//! Static ability definitions. Loaded once from the catalog, never mutated.

use serde::{Deserialize, Serialize};

use crate::ids::{AbilityId, EffectTemplateId};

/// Which entities an ability may target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TargetPattern {
    /// Only the caster.
    SelfOnly,
    /// Exactly one target.
    Single,
    /// Up to `max_targets` distinct targets.
    Multi {
        /// Maximum target count.
        max_targets: u8,
    },
    /// Every entity within `radius` of the center (first target or caster).
    Area {
        /// Radius around the center.
        radius: f32,
    },
}

/// Rift opened by a rift-causing ability.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiftSpec {
    /// Initial stability impact.
    pub impact: f32,
    /// Radius.
    pub radius: f32,
    /// Impact added every tick.
    #[serde(default)]
    pub growth_per_tick: f32,
    /// Lifetime in ticks.
    pub duration_ticks: u32,
}

/// Ability categories.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AbilityKind {
    /// Direct damage; fires on-hit chains of the target's effects.
    Strike,
    /// Applies effects only.
    Hex,
    /// Restores health.
    Mend,
    /// Removes harmful effects.
    Cleanse,
    /// Opens a rift. Denied in throttled dimensions.
    Riftcall {
        /// Rift to open.
        rift: RiftSpec,
    },
    /// Closes rifts around the center.
    Seal {
        /// Radius around the center.
        radius: f32,
    },
}

/// Static ability definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ability {
    /// Ability id.
    pub id: AbilityId,
    /// Display name.
    pub name: String,
    /// Energy cost.
    #[serde(default)]
    pub cost: u32,
    /// Cooldown in ticks.
    #[serde(default)]
    pub cooldown_ticks: u64,
    /// Target pattern.
    pub pattern: TargetPattern,
    /// Category.
    pub kind: AbilityKind,
    /// Base damage or healing.
    #[serde(default)]
    pub base_power: u32,
    /// Effects applied to each resolved target.
    #[serde(default)]
    pub effects: Vec<EffectTemplateId>,
}

impl Ability {
    /// Returns true for abilities that open rifts.
    #[inline]
    #[must_use]
    pub const fn is_rift_causing(&self) -> bool {
        matches!(self.kind, AbilityKind::Riftcall { .. })
    }

    /// Returns true when the caster belongs inside its own area.
    #[inline]
    #[must_use]
    pub const fn is_supportive(&self) -> bool {
        matches!(self.kind, AbilityKind::Mend | AbilityKind::Cleanse | AbilityKind::Seal { .. })
    }
}
