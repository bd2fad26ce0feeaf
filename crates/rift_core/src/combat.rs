//! # Combat Resolver
//!
//! Turns ability invocations into state changes, one dimension at a time.
//!
//! ## Two Phases
//!
//! 1. **Plan**: every invocation of the tick is validated and its targets
//!    and base amounts are computed against the same untouched dimension.
//! 2. **Commit**: plans are applied in arrival order. Cooldown and energy
//!    are checked again against live state, so two invocations by one caster
//!    in one tick cannot spend the same energy twice.
//!
//! A rejected invocation mutates nothing: all checks run before the first
//! write, and the dimension RNG is only drawn during commit.
//!
//! ## Damage
//!
//! ```text
//! raw    = base_power * (100 + mastery) / 100
//! scaled = raw * (attack + 100) / (defense + 100)      (min 1)
//! crit   = scaled * crit_multiplier_pct / 100          (crit_chance_pct)
//! ```

use rand::Rng;

use crate::ability::{Ability, AbilityKind, TargetPattern};
use crate::catalog::Catalog;
use crate::config::CombatConfig;
use crate::dimension::Dimension;
use crate::entity::{CombatStats, Entity, Position};
use crate::error::{Rejection, RejectionResult};
use crate::events::{RiftCloseCause, SimEvent};
use crate::ids::{AbilityId, DimensionId, EffectTemplateId, EntityId, InvocationId, RiftId, Tick};
use crate::pipeline::{ApplyOutcome, EffectPipeline};

/// A request to use an ability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbilityInvocation {
    /// Invocation id, assigned at submission.
    pub id: InvocationId,
    /// Caster.
    pub caster: EntityId,
    /// Ability to use.
    pub ability: AbilityId,
    /// Requested targets (meaning depends on the ability's pattern).
    pub targets: Vec<EntityId>,
    /// Dimension the caller believes the caster is in.
    pub dimension: DimensionId,
    /// Tick current when the invocation was submitted.
    pub tick_submitted: Tick,
}

/// Direct damage dealt to one target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hit {
    /// Target.
    pub target: EntityId,
    /// Health removed.
    pub damage: u32,
    /// Critical hit.
    pub critical: bool,
    /// Target reached zero health.
    pub defeated: bool,
}

/// Everything a committed invocation did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CombatOutcome {
    /// Resolved targets.
    pub targets: Vec<EntityId>,
    /// Direct damage.
    pub hits: Vec<Hit>,
    /// Healing done per target.
    pub healed: Vec<(EntityId, u32)>,
    /// Effect application outcomes.
    pub effects: Vec<(EntityId, EffectTemplateId, ApplyOutcome)>,
    /// Harmful effects removed.
    pub cleansed: usize,
    /// Rift opened.
    pub rift_opened: Option<RiftId>,
    /// Rifts sealed.
    pub rifts_sealed: Vec<RiftId>,
}

/// Result of one invocation, returned to its originator.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// Invocation id.
    pub invocation: InvocationId,
    /// Caster.
    pub caster: EntityId,
    /// Ability.
    pub ability: AbilityId,
    /// Outcome or rejection.
    pub result: Result<CombatOutcome, Rejection>,
}

impl Resolution {
    /// A rejection that never reached a dimension.
    #[must_use]
    pub fn rejected(invocation: &AbilityInvocation, reason: Rejection) -> Self {
        Self {
            invocation: invocation.id,
            caster: invocation.caster,
            ability: invocation.ability,
            result: Err(reason),
        }
    }
}

/// One invocation planned against the tick snapshot.
#[derive(Clone, Debug)]
pub struct CombatInstance<'a> {
    /// Ability definition.
    pub ability: &'a Ability,
    /// Caster.
    pub caster: EntityId,
    /// Resolved targets, in resolution order.
    pub targets: Vec<EntityId>,
    /// Center of the pattern.
    pub center: Position,
    /// Planned damage or healing per target, before crits.
    pub amounts: Vec<u32>,
}

/// Damage dealt by `base_power` from `attacker` to `defender`.
#[must_use]
pub fn scaled_damage(base_power: u32, attacker: &CombatStats, defender: &CombatStats) -> u32 {
    if base_power == 0 {
        return 0;
    }
    let raw = u64::from(base_power) * (100 + u64::from(attacker.mastery)) / 100;
    let scaled = raw * (u64::from(attacker.attack) + 100) / (u64::from(defender.defense) + 100);
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}

/// Healing done by `base_power` from `caster`.
#[must_use]
pub fn scaled_healing(base_power: u32, caster: &CombatStats) -> u32 {
    let raw = u64::from(base_power) * (100 + u64::from(caster.mastery)) / 100;
    raw.min(u64::from(u32::MAX)) as u32
}

/// Resolves the invocations of one dimension.
pub struct CombatResolver<'a> {
    catalog: &'a Catalog,
    config: &'a CombatConfig,
    pipeline: EffectPipeline<'a>,
}

impl<'a> CombatResolver<'a> {
    /// Creates a resolver.
    #[must_use]
    pub const fn new(catalog: &'a Catalog, config: &'a CombatConfig, pipeline: EffectPipeline<'a>) -> Self {
        Self { catalog, config, pipeline }
    }

    /// Resolves every invocation routed to `dim` this tick.
    ///
    /// Results are in arrival order.
    pub fn resolve_tick(
        &self,
        dim: &mut Dimension,
        invocations: Vec<AbilityInvocation>,
        tick: Tick,
        events: &mut Vec<SimEvent>,
    ) -> Vec<Resolution> {
        let plans: Vec<_> = invocations.iter().map(|inv| self.plan(dim, inv, tick)).collect();

        let mut resolutions = Vec::with_capacity(invocations.len());
        for (invocation, plan) in invocations.into_iter().zip(plans) {
            let result = plan.and_then(|instance| self.commit(dim, &invocation, instance, tick, events));
            match &result {
                Ok(outcome) => {
                    events.push(SimEvent::AbilityResolved {
                        dimension: dim.id(),
                        invocation: invocation.id,
                        caster: invocation.caster,
                        ability: invocation.ability,
                        targets: outcome.targets.clone(),
                        damage: outcome.hits.iter().map(|h| h.damage).sum(),
                        healing: outcome.healed.iter().map(|(_, h)| h).sum(),
                    });
                }
                Err(reason) => {
                    tracing::debug!(
                        dimension = %dim.id(),
                        invocation = invocation.id.0,
                        caster = %invocation.caster,
                        %reason,
                        "invocation rejected"
                    );
                    events.push(SimEvent::AbilityRejected {
                        invocation: invocation.id,
                        caster: invocation.caster,
                        ability: invocation.ability,
                        reason: reason.clone(),
                    });
                }
            }
            resolutions.push(Resolution {
                invocation: invocation.id,
                caster: invocation.caster,
                ability: invocation.ability,
                result,
            });
        }
        resolutions
    }

    /// Validates an invocation and plans it against `dim` without mutating it.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn plan(&self, dim: &Dimension, invocation: &AbilityInvocation, tick: Tick) -> RejectionResult<CombatInstance<'a>> {
        let ability = self
            .catalog
            .ability(invocation.ability)
            .ok_or(Rejection::UnknownAbility(invocation.ability))?;
        let caster = dim
            .entity(invocation.caster)
            .ok_or(Rejection::UnknownEntity(invocation.caster))?;
        check_caster(caster, ability, tick)?;

        if ability.is_rift_causing() && dim.state().is_throttled() {
            return Err(Rejection::DimensionThrottled(dim.id()));
        }

        let (targets, center) = resolve_targets(dim, ability, invocation, caster)?;
        let amounts = targets
            .iter()
            .filter_map(|&id| dim.entity(id))
            .map(|target| match ability.kind {
                AbilityKind::Strike => scaled_damage(ability.base_power, &caster.stats, &target.stats),
                AbilityKind::Mend => scaled_healing(ability.base_power, &caster.stats),
                _ => 0,
            })
            .collect();

        Ok(CombatInstance { ability, caster: caster.id, targets, center, amounts })
    }

    fn commit(
        &self,
        dim: &mut Dimension,
        invocation: &AbilityInvocation,
        instance: CombatInstance<'a>,
        tick: Tick,
        events: &mut Vec<SimEvent>,
    ) -> RejectionResult<CombatOutcome> {
        let ability = instance.ability;
        let caster = dim
            .entity(invocation.caster)
            .ok_or(Rejection::UnknownEntity(invocation.caster))?;
        check_caster(caster, ability, tick)?;

        // Checks passed: from here on the invocation always commits.
        if let Some(caster) = dim.entity_mut(invocation.caster) {
            caster.energy.drain(ability.cost);
            if ability.cooldown_ticks > 0 {
                caster.cooldowns.insert(ability.id, tick + ability.cooldown_ticks);
            }
        }

        let dimension = dim.id();
        let mut outcome = CombatOutcome { targets: instance.targets.clone(), ..CombatOutcome::default() };

        match ability.kind {
            AbilityKind::Strike => {
                for (&target, &base) in instance.targets.iter().zip(&instance.amounts) {
                    if !dim.entity(target).is_some_and(Entity::is_alive) {
                        continue;
                    }
                    let critical = dim.rng.gen_range(0..100u8) < self.config.crit_chance_pct;
                    let damage = if critical {
                        (u64::from(base) * u64::from(self.config.crit_multiplier_pct) / 100).min(u64::from(u32::MAX)) as u32
                    } else {
                        base
                    };
                    if let Some(entity) = dim.entity_mut(target) {
                        let dealt = entity.health.drain(damage);
                        outcome.hits.push(Hit { target, damage: dealt, critical, defeated: !entity.is_alive() });
                    }
                    self.pipeline.trigger_on_hit(dim, target, events);
                }
            }
            AbilityKind::Mend => {
                for (&target, &amount) in instance.targets.iter().zip(&instance.amounts) {
                    if let Some(entity) = dim.entity_mut(target).filter(|e| e.is_alive()) {
                        outcome.healed.push((target, entity.health.restore(amount)));
                    }
                }
            }
            AbilityKind::Cleanse => {
                for &target in &instance.targets {
                    outcome.cleansed += self.pipeline.cleanse(dim, target, events);
                }
            }
            AbilityKind::Riftcall { rift } => {
                let id = dim.open_rift(&rift, instance.center);
                events.push(SimEvent::RiftOpened { dimension, rift: id, impact: rift.impact });
                outcome.rift_opened = Some(id);
            }
            AbilityKind::Seal { radius } => {
                outcome.rifts_sealed = dim.close_rifts_within(instance.center, radius);
                events.extend(outcome.rifts_sealed.iter().map(|&rift| SimEvent::RiftClosed {
                    dimension,
                    rift,
                    cause: RiftCloseCause::Sealed,
                }));
            }
            AbilityKind::Hex => {}
        }

        for &template in &ability.effects {
            let applied = self.pipeline.propagate(dim, template, instance.caster, &instance.targets, events);
            outcome
                .effects
                .extend(applied.into_iter().map(|(target, result)| (target, template, result)));
        }

        Ok(outcome)
    }
}

fn check_caster(caster: &Entity, ability: &Ability, tick: Tick) -> RejectionResult<()> {
    if !caster.is_alive() {
        return Err(Rejection::InvalidTarget { target: Some(caster.id), reason: "caster is defeated" });
    }
    let remaining_ticks = caster.cooldown_remaining(ability.id, tick);
    if remaining_ticks > 0 {
        return Err(Rejection::OnCooldown { ability: ability.id, remaining_ticks });
    }
    if caster.energy.current < ability.cost {
        return Err(Rejection::InsufficientResources {
            required: ability.cost,
            available: caster.energy.current,
        });
    }
    Ok(())
}

fn living(dim: &Dimension, id: EntityId) -> RejectionResult<&Entity> {
    dim.entity(id)
        .filter(|e| e.is_alive())
        .ok_or(Rejection::InvalidTarget { target: Some(id), reason: "target is not alive in this dimension" })
}

fn resolve_targets(
    dim: &Dimension,
    ability: &Ability,
    invocation: &AbilityInvocation,
    caster: &Entity,
) -> RejectionResult<(Vec<EntityId>, Position)> {
    let requested = &invocation.targets;
    match ability.pattern {
        TargetPattern::SelfOnly => {
            if let Some(&other) = requested.iter().find(|&&t| t != caster.id) {
                return Err(Rejection::InvalidTarget { target: Some(other), reason: "ability targets only its caster" });
            }
            Ok((vec![caster.id], caster.position))
        }
        TargetPattern::Single => {
            let [target] = requested.as_slice() else {
                return Err(Rejection::InvalidTarget { target: None, reason: "ability needs exactly one target" });
            };
            let target = living(dim, *target)?;
            Ok((vec![target.id], target.position))
        }
        TargetPattern::Multi { max_targets } => {
            if requested.is_empty() || requested.len() > usize::from(max_targets) {
                return Err(Rejection::InvalidTarget { target: None, reason: "target count outside the ability's range" });
            }
            for (i, id) in requested.iter().enumerate() {
                if requested[..i].contains(id) {
                    return Err(Rejection::InvalidTarget { target: Some(*id), reason: "duplicate target" });
                }
                living(dim, *id)?;
            }
            let center = living(dim, requested[0])?.position;
            Ok((requested.clone(), center))
        }
        TargetPattern::Area { radius } => {
            let center = match requested.as_slice() {
                [] => caster.position,
                [anchor] => living(dim, *anchor)?.position,
                _ => {
                    return Err(Rejection::InvalidTarget { target: None, reason: "area abilities take at most one anchor" });
                }
            };
            let exclude = (!ability.is_supportive()).then_some(caster.id);
            Ok((dim.entities_within(center, radius, exclude), center))
        }
    }
}
