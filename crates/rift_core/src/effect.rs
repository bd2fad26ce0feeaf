//! # Effects
//!
//! Effect templates are static content; effect instances are runtime state
//! owned by the entity they are applied to.
//!
//! Every effect category is a variant of [`EffectKind`] and is driven through
//! the same fixed interface: [`EffectTemplate::apply`],
//! [`EffectKind::tick`], [`EffectTemplate::expire`] and
//! [`EffectTemplate::chain_targets`].

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::ids::{EffectTemplateId, EntityId};

/// Largest per-stack, per-tick amount a catalog may declare.
pub const MAX_TICK_AMOUNT: u32 = 1_000_000;

/// Effect categories.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EffectKind {
    /// Health loss every tick, per stack.
    DamageOverTime {
        /// Damage per tick per stack.
        per_tick: u32,
    },
    /// Health gain every tick, per stack.
    HealOverTime {
        /// Healing per tick per stack.
        per_tick: u32,
    },
    /// Energy loss every tick, per stack.
    Drain {
        /// Energy drained per tick per stack.
        per_tick: u32,
    },
    /// Immunity to harmful effects while active.
    Ward,
    /// Adds pressure to the dimension's stability while active.
    Destabilize {
        /// Stability lost per stack.
        per_stack: f32,
    },
}

impl EffectKind {
    /// Returns true if the effect hurts its target (blocked by immunity).
    #[inline]
    #[must_use]
    pub const fn is_harmful(&self) -> bool {
        matches!(
            self,
            Self::DamageOverTime { .. } | Self::Drain { .. } | Self::Destabilize { .. }
        )
    }

    /// Per-stack amount moved every tick, for the ticking kinds.
    #[inline]
    #[must_use]
    pub const fn tick_amount(&self) -> Option<u32> {
        match *self {
            Self::DamageOverTime { per_tick } | Self::HealOverTime { per_tick } | Self::Drain { per_tick } => {
                Some(per_tick)
            }
            Self::Ward | Self::Destabilize { .. } => None,
        }
    }

    /// Applies one tick of the effect to its target.
    ///
    /// Returns true if the target's observable state changed.
    pub fn tick(&self, stacks: u8, target: &mut Entity) -> bool {
        let stacks = u32::from(stacks);
        match *self {
            Self::DamageOverTime { per_tick } => target.health.drain(per_tick.saturating_mul(stacks)) > 0,
            Self::HealOverTime { per_tick } => {
                target.is_alive() && target.health.restore(per_tick.saturating_mul(stacks)) > 0
            }
            Self::Drain { per_tick } => target.energy.drain(per_tick.saturating_mul(stacks)) > 0,
            Self::Ward | Self::Destabilize { .. } => false,
        }
    }

    /// Stability pressure contributed by `stacks` stacks.
    #[inline]
    #[must_use]
    pub fn destabilization(&self, stacks: u8) -> f32 {
        match *self {
            Self::Destabilize { per_stack } => per_stack * f32::from(stacks),
            _ => 0.0,
        }
    }
}

/// Condition that fires a chained effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainTrigger {
    /// When the effect lands (new instance or extra stack).
    OnApply,
    /// When the effect's target is hit by a damaging ability.
    OnHit,
    /// When the effect runs out.
    OnExpire,
}

/// Who receives a chained effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainTarget {
    /// The entity carrying the triggering effect.
    #[default]
    Target,
    /// The entity that applied the triggering effect.
    Source,
}

/// A follow-up effect declared by a template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRule {
    /// Firing condition.
    pub trigger: ChainTrigger,
    /// Template to apply.
    pub template: EffectTemplateId,
    /// Recipient.
    #[serde(default)]
    pub target: ChainTarget,
}

/// Static effect definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectTemplate {
    /// Template id.
    pub id: EffectTemplateId,
    /// Display name.
    pub name: String,
    /// Behavior.
    pub kind: EffectKind,
    /// Lifetime in ticks.
    pub duration_ticks: u32,
    /// Stack cap.
    pub max_stacks: u8,
    /// Follow-up effects.
    #[serde(default)]
    pub chain: Vec<ChainRule>,
}

/// A request to apply an effect, queued inside the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingApplication {
    /// Template to apply.
    pub template: EffectTemplateId,
    /// Entity applying the effect.
    pub source: EntityId,
    /// Entity receiving the effect.
    pub target: EntityId,
    /// Number of chain links that led here (0 for a direct application).
    pub depth: u32,
}

impl PendingApplication {
    /// A direct (unchained) application.
    #[inline]
    #[must_use]
    pub const fn direct(template: EffectTemplateId, source: EntityId, target: EntityId) -> Self {
        Self { template, source, target, depth: 0 }
    }
}

/// Runtime effect state on an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EffectInstance {
    /// Template this instance was created from.
    pub template: EffectTemplateId,
    /// Ticks left before expiry.
    pub remaining_ticks: u32,
    /// Current stack count (1..=template cap).
    pub stacks: u8,
    /// Entity that applied the effect.
    pub source: EntityId,
    /// Entity carrying the effect.
    pub target: EntityId,
    /// Chain depth of the application that created it.
    pub depth: u32,
}

impl EffectTemplate {
    /// Creates a fresh single-stack instance.
    #[must_use]
    pub fn apply(&self, application: &PendingApplication) -> EffectInstance {
        EffectInstance {
            template: self.id,
            remaining_ticks: self.duration_ticks,
            stacks: 1,
            source: application.source,
            target: application.target,
            depth: application.depth,
        }
    }

    /// Follow-up applications fired when `instance` expires.
    pub fn expire<'a>(
        &'a self,
        instance: &'a EffectInstance,
    ) -> impl Iterator<Item = PendingApplication> + 'a {
        self.chain_targets(ChainTrigger::OnExpire, instance)
    }

    /// Follow-up applications fired by `trigger` on `instance`.
    pub fn chain_targets<'a>(
        &'a self,
        trigger: ChainTrigger,
        instance: &'a EffectInstance,
    ) -> impl Iterator<Item = PendingApplication> + 'a {
        self.chain
            .iter()
            .filter(move |rule| rule.trigger == trigger)
            .map(move |rule| PendingApplication {
                template: rule.template,
                source: instance.target,
                target: match rule.target {
                    ChainTarget::Target => instance.target,
                    ChainTarget::Source => instance.source,
                },
                depth: instance.depth + 1,
            })
    }
}
