//! # Effect Pipeline
//!
//! Applies effect templates to entities and advances their timers.
//!
//! ## Rules
//!
//! - **Stacking**: an application of a template the target already carries
//!   adds a stack (up to the template cap) and refreshes the duration.
//!   Applications beyond the cap are dropped and reported.
//! - **Chaining**: follow-ups declared by a template are queued and applied
//!   in the same tick, breadth-first. Each link increments the chain depth;
//!   anything deeper than the limit is dropped, so cyclic templates
//!   terminate.
//! - **Propagation**: area applications are evaluated per target. One
//!   target's immunity or missing slot never affects the others.
//! - **Capacity**: a new instance needs a free slot under the dimension's
//!   ceiling. Stacks do not take slots; expiries free them.

use std::collections::VecDeque;

use crate::catalog::Catalog;
use crate::dimension::Dimension;
use crate::effect::{ChainTrigger, EffectInstance, EffectKind, PendingApplication};
use crate::entity::{Entity, Position};
use crate::events::{DropReason, ExpiryCause, SimEvent};
use crate::ids::{EffectTemplateId, EntityId};

/// Result of one application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New instance created.
    Applied,
    /// Existing instance gained a stack.
    Stacked {
        /// Stack count after the application.
        stacks: u8,
    },
    /// Target already at the stack cap; dropped.
    StackCapped,
    /// Target immune; dropped.
    Immune,
    /// Dimension at its effect ceiling; refused.
    CapacityExceeded,
    /// Target gone or dead; dropped.
    TargetMissing,
    /// Chain depth limit reached; dropped.
    ChainDepthExceeded,
    /// Template not in the catalog.
    UnknownTemplate,
}

impl ApplyOutcome {
    /// Returns true if the effect is now on the target.
    #[inline]
    #[must_use]
    pub const fn landed(self) -> bool {
        matches!(self, Self::Applied | Self::Stacked { .. })
    }
}

/// Effect-timer work done in one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    /// Entities whose timers were advanced.
    pub processed: usize,
    /// Entities carried to the next tick.
    pub deferred: usize,
    /// Instances that expired.
    pub expired: usize,
}

/// Stateless effect engine over a catalog.
#[derive(Clone, Copy)]
pub struct EffectPipeline<'a> {
    catalog: &'a Catalog,
    max_chain_depth: u32,
}

impl<'a> EffectPipeline<'a> {
    /// Creates a pipeline.
    #[must_use]
    pub const fn new(catalog: &'a Catalog, max_chain_depth: u32) -> Self {
        Self { catalog, max_chain_depth }
    }

    /// Chain depth limit.
    #[inline]
    #[must_use]
    pub const fn max_chain_depth(&self) -> u32 {
        self.max_chain_depth
    }

    /// Applies one effect and everything it chains.
    ///
    /// Returns the outcome of the initial application.
    pub fn apply(&self, dim: &mut Dimension, application: PendingApplication, events: &mut Vec<SimEvent>) -> ApplyOutcome {
        let mut queue = VecDeque::new();
        let outcome = self.apply_one(dim, application, &mut queue, events);
        self.drain(dim, queue, events);
        outcome
    }

    /// Applies `template` independently to each of `targets`.
    pub fn propagate(
        &self,
        dim: &mut Dimension,
        template: EffectTemplateId,
        source: EntityId,
        targets: &[EntityId],
        events: &mut Vec<SimEvent>,
    ) -> Vec<(EntityId, ApplyOutcome)> {
        targets
            .iter()
            .map(|&target| {
                let outcome = self.apply(dim, PendingApplication::direct(template, source, target), events);
                (target, outcome)
            })
            .collect()
    }

    /// Applies `template` to every living entity within `radius` of `center`.
    pub fn propagate_area(
        &self,
        dim: &mut Dimension,
        template: EffectTemplateId,
        source: EntityId,
        center: Position,
        radius: f32,
        events: &mut Vec<SimEvent>,
    ) -> Vec<(EntityId, ApplyOutcome)> {
        let targets = dim.entities_within(center, radius, None);
        self.propagate(dim, template, source, &targets, events)
    }

    /// Fires the on-hit chains of every effect carried by `target`.
    pub fn trigger_on_hit(&self, dim: &mut Dimension, target: EntityId, events: &mut Vec<SimEvent>) {
        let Some(entity) = dim.entity(target) else {
            return;
        };
        let chained: VecDeque<_> = entity
            .effects
            .iter()
            .filter_map(|instance| self.catalog.effect(instance.template).map(|t| (t, instance)))
            .flat_map(|(template, instance)| template.chain_targets(ChainTrigger::OnHit, instance))
            .collect();
        self.drain(dim, chained, events);
    }

    /// Advances effect timers for up to `budget` entities, round-robin.
    ///
    /// Entities beyond the budget are picked up first on the next call.
    /// Expiry chains fire in the same tick.
    pub fn advance(&self, dim: &mut Dimension, budget: usize, events: &mut Vec<SimEvent>) -> AdvanceReport {
        let ids = dim.entity_ids();
        let total = ids.len();
        if total == 0 {
            dim.effect_cursor = None;
            return AdvanceReport::default();
        }

        let start = dim.effect_cursor.map_or(0, |cursor| ids.partition_point(|&id| id < cursor) % total);
        let count = budget.min(total);
        let mut chained = VecDeque::new();
        let mut expired = 0;

        for offset in 0..count {
            expired += self.advance_entity(dim, ids[(start + offset) % total], &mut chained, events);
        }

        dim.effect_cursor = (count < total).then(|| ids[(start + count) % total]);
        self.drain(dim, chained, events);

        AdvanceReport { processed: count, deferred: total - count, expired }
    }

    /// Removes every harmful effect from `entity`. Returns how many ended.
    pub fn cleanse(&self, dim: &mut Dimension, entity: EntityId, events: &mut Vec<SimEvent>) -> usize {
        let removed = self.remove_effects(dim, entity, |kind| kind.is_harmful());
        let count = removed.len();
        self.report_removed(dim, entity, removed, ExpiryCause::Cleansed, events);
        count
    }

    /// Removes every effect in the dimension without firing chains.
    pub fn clear_dimension(&self, dim: &mut Dimension, events: &mut Vec<SimEvent>) -> usize {
        let mut total = 0;
        for id in dim.entity_ids() {
            let removed = self.remove_effects(dim, id, |_| true);
            total += removed.len();
            self.report_removed(dim, id, removed, ExpiryCause::Cleared, events);
        }
        total
    }

    /// Stability pressure of every destabilizing effect in the dimension.
    #[must_use]
    pub fn destabilization(&self, dim: &Dimension) -> f32 {
        dim.entities()
            .flat_map(|e| e.effects.iter())
            .filter_map(|i| self.catalog.effect(i.template).map(|t| t.kind.destabilization(i.stacks)))
            .sum()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn drain(&self, dim: &mut Dimension, mut queue: VecDeque<PendingApplication>, events: &mut Vec<SimEvent>) {
        while let Some(next) = queue.pop_front() {
            self.apply_one(dim, next, &mut queue, events);
        }
    }

    fn is_immune(&self, entity: &Entity, template: EffectTemplateId) -> bool {
        entity.immunities.contains(&template)
            || entity.effects.iter().any(|active| {
                self.catalog
                    .effect(active.template)
                    .is_some_and(|t| matches!(t.kind, EffectKind::Ward))
            })
    }

    fn apply_one(
        &self,
        dim: &mut Dimension,
        application: PendingApplication,
        queue: &mut VecDeque<PendingApplication>,
        events: &mut Vec<SimEvent>,
    ) -> ApplyOutcome {
        let dimension = dim.id();
        let drop = |reason: DropReason, events: &mut Vec<SimEvent>| {
            tracing::debug!(%dimension, target = %application.target, template = ?application.template, ?reason, "effect dropped");
            events.push(SimEvent::EffectDropped {
                dimension,
                target: application.target,
                template: application.template,
                reason,
            });
        };

        if application.depth > self.max_chain_depth {
            drop(DropReason::ChainDepth, events);
            return ApplyOutcome::ChainDepthExceeded;
        }
        let Some(template) = self.catalog.effect(application.template) else {
            return ApplyOutcome::UnknownTemplate;
        };
        let Some(target) = dim.entity(application.target).filter(|e| e.is_alive()) else {
            drop(DropReason::TargetMissing, events);
            return ApplyOutcome::TargetMissing;
        };
        if template.kind.is_harmful() && self.is_immune(target, template.id) {
            drop(DropReason::Immune, events);
            return ApplyOutcome::Immune;
        }

        let existing = target
            .effects
            .iter()
            .position(|e| e.template == template.id)
            .map(|index| (index, target.effects[index].stacks));

        let (outcome, landed) = match existing {
            Some((_, stacks)) if stacks >= template.max_stacks => {
                drop(DropReason::StackCapped, events);
                return ApplyOutcome::StackCapped;
            }
            Some((index, stacks)) => {
                let Some(entity) = dim.entity_mut(application.target) else {
                    return ApplyOutcome::TargetMissing;
                };
                let instance = &mut entity.effects[index];
                instance.stacks = stacks + 1;
                instance.remaining_ticks = template.duration_ticks;
                instance.source = application.source;
                (ApplyOutcome::Stacked { stacks: stacks + 1 }, *instance)
            }
            None if dim.active_effects >= dim.effect_ceiling() => {
                let ceiling = dim.effect_ceiling();
                tracing::debug!(%dimension, ceiling, template = ?template.id, "effect ceiling reached");
                events.push(SimEvent::EffectCapacityExceeded {
                    dimension,
                    target: application.target,
                    template: template.id,
                    ceiling,
                });
                return ApplyOutcome::CapacityExceeded;
            }
            None => {
                let instance = template.apply(&application);
                let Some(entity) = dim.entity_mut(application.target) else {
                    return ApplyOutcome::TargetMissing;
                };
                entity.effects.push(instance);
                dim.active_effects += 1;
                (ApplyOutcome::Applied, instance)
            }
        };

        events.push(SimEvent::EffectApplied {
            dimension,
            target: application.target,
            source: application.source,
            template: template.id,
            stacks: landed.stacks,
            depth: application.depth,
        });

        let trigger = EffectInstance { depth: application.depth, ..landed };
        queue.extend(template.chain_targets(ChainTrigger::OnApply, &trigger));
        outcome
    }

    /// Ticks every effect on one entity. Returns how many expired.
    fn advance_entity(
        &self,
        dim: &mut Dimension,
        id: EntityId,
        chained: &mut VecDeque<PendingApplication>,
        events: &mut Vec<SimEvent>,
    ) -> usize {
        let Some(entity) = dim.entity_slot(id) else {
            return 0;
        };

        let mut changed = entity.is_alive() && entity.energy.restore(entity.energy_regen) > 0;
        let mut effects = std::mem::take(&mut entity.effects);
        let mut expired = Vec::new();

        for instance in &mut effects {
            if let Some(template) = self.catalog.effect(instance.template) {
                template.kind.tick(instance.stacks, entity);
            }
            instance.remaining_ticks = instance.remaining_ticks.saturating_sub(1);
            changed = true;
            if instance.remaining_ticks == 0 {
                expired.push(*instance);
            }
        }
        effects.retain(|e| e.remaining_ticks > 0);
        entity.effects = effects;

        if changed {
            dim.mark_entity_changed(id);
        }
        dim.active_effects -= expired.len();

        let dimension = dim.id();
        for instance in &expired {
            events.push(SimEvent::EffectExpired {
                dimension,
                target: id,
                template: instance.template,
                cause: ExpiryCause::Duration,
            });
            if let Some(template) = self.catalog.effect(instance.template) {
                chained.extend(template.expire(instance));
            }
        }
        expired.len()
    }

    fn remove_effects(
        &self,
        dim: &mut Dimension,
        id: EntityId,
        selector: impl Fn(&EffectKind) -> bool,
    ) -> Vec<EffectInstance> {
        let Some(entity) = dim.entity_slot(id) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entity.effects)
            .into_iter()
            .partition(|i| self.catalog.effect(i.template).is_some_and(|t| selector(&t.kind)));
        entity.effects = kept;

        if !removed.is_empty() {
            dim.active_effects -= removed.len();
            dim.mark_entity_changed(id);
        }
        removed
    }

    fn report_removed(
        &self,
        dim: &Dimension,
        target: EntityId,
        removed: Vec<EffectInstance>,
        cause: ExpiryCause,
        events: &mut Vec<SimEvent>,
    ) {
        let dimension = dim.id();
        events.extend(removed.into_iter().map(|instance| SimEvent::EffectExpired {
            dimension,
            target,
            template: instance.template,
            cause,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::catalog::StatTable;
    use crate::dimension::DimensionKind;
    use crate::effect::{ChainRule, ChainTarget, EffectTemplate};
    use crate::entity::EntityProfile;
    use crate::ids::DimensionId;

    const BURN: EffectTemplateId = EffectTemplateId(1);
    const WARD: EffectTemplateId = EffectTemplateId(2);
    const PING: EffectTemplateId = EffectTemplateId(3);
    const PONG: EffectTemplateId = EffectTemplateId(4);
    const REGEN: EffectTemplateId = EffectTemplateId(5);

    fn template(id: EffectTemplateId, kind: EffectKind, duration: u32, stacks: u8, chain: Vec<ChainRule>) -> EffectTemplate {
        EffectTemplate { id, name: format!("t{}", id.0), kind, duration_ticks: duration, max_stacks: stacks, chain }
    }

    fn catalog() -> Catalog {
        let on_apply = |t| vec![ChainRule { trigger: ChainTrigger::OnApply, template: t, target: ChainTarget::Target }];
        Catalog::new(
            Vec::new(),
            vec![
                template(BURN, EffectKind::DamageOverTime { per_tick: 5 }, 2, 3, vec![
                    ChainRule { trigger: ChainTrigger::OnExpire, template: REGEN, target: ChainTarget::Target },
                ]),
                template(WARD, EffectKind::Ward, 10, 1, Vec::new()),
                template(PING, EffectKind::Drain { per_tick: 1 }, 5, u8::MAX, on_apply(PONG)),
                template(PONG, EffectKind::Drain { per_tick: 1 }, 5, u8::MAX, on_apply(PING)),
                template(REGEN, EffectKind::HealOverTime { per_tick: 1 }, 1, 1, Vec::new()),
            ],
            StatTable::default(),
        )
        .unwrap()
    }

    fn dimension(entities: u32, ceiling: usize) -> Dimension {
        let id = DimensionId(ArenaKey { index: 0, generation: 0 });
        let mut dim = Dimension::new(id, DimensionKind::Ethereal, 64, ceiling, 7, false);
        for i in 1..=entities {
            let entity = Entity::from_profile(EntityId(i), id, Position::new(i as f32, 0.0), &EntityProfile::default());
            assert!(dim.admit(entity).is_ok());
        }
        dim
    }

    fn direct(template: EffectTemplateId, target: u32) -> PendingApplication {
        PendingApplication::direct(template, EntityId(99), EntityId(target))
    }

    #[test]
    fn test_stacking_refreshes_and_caps() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(1, 16);
        let mut events = Vec::new();

        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events), ApplyOutcome::Applied);
        pipeline.advance(&mut dim, usize::MAX, &mut events);
        assert_eq!(dim.entity(EntityId(1)).unwrap().effects[0].remaining_ticks, 1);

        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events), ApplyOutcome::Stacked { stacks: 2 });
        assert_eq!(dim.entity(EntityId(1)).unwrap().effects[0].remaining_ticks, 2);
        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events), ApplyOutcome::Stacked { stacks: 3 });
        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events), ApplyOutcome::StackCapped);

        let burn = dim.entity(EntityId(1)).unwrap().effect(BURN).unwrap();
        assert_eq!(burn.stacks, 3);
        assert_eq!(dim.active_effects(), 1);
        assert!(events.iter().any(|e| matches!(e, SimEvent::EffectDropped { reason: DropReason::StackCapped, .. })));
    }

    #[test]
    fn test_capacity_counts_instances_not_stacks() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(3, 2);
        let mut events = Vec::new();

        assert!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events).landed());
        assert!(pipeline.apply(&mut dim, direct(BURN, 2), &mut events).landed());
        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 3), &mut events), ApplyOutcome::CapacityExceeded);
        // Stacking onto an existing instance needs no slot.
        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events), ApplyOutcome::Stacked { stacks: 2 });
        assert_eq!(dim.active_effects(), 2);
        assert!(events.iter().any(|e| matches!(e, SimEvent::EffectCapacityExceeded { ceiling: 2, .. })));
    }

    #[test]
    fn test_ward_blocks_harmful_only() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(1, 16);
        let mut events = Vec::new();

        assert_eq!(pipeline.apply(&mut dim, direct(WARD, 1), &mut events), ApplyOutcome::Applied);
        assert_eq!(pipeline.apply(&mut dim, direct(BURN, 1), &mut events), ApplyOutcome::Immune);
        assert_eq!(pipeline.apply(&mut dim, direct(REGEN, 1), &mut events), ApplyOutcome::Applied);
    }

    #[test]
    fn test_cyclic_chain_stops_at_depth_limit() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 5);
        let mut dim = dimension(1, 16);
        let mut events = Vec::new();

        assert_eq!(pipeline.apply(&mut dim, direct(PING, 1), &mut events), ApplyOutcome::Applied);

        let max_depth = events
            .iter()
            .filter_map(|e| match e {
                SimEvent::EffectApplied { depth, .. } => Some(*depth),
                _ => None,
            })
            .max();
        assert_eq!(max_depth, Some(5));
        assert!(events.iter().any(|e| matches!(e, SimEvent::EffectDropped { reason: DropReason::ChainDepth, .. })));
    }

    #[test]
    fn test_expiry_frees_slot_and_fires_chain() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(1, 16);
        let mut events = Vec::new();

        pipeline.apply(&mut dim, direct(BURN, 1), &mut events);
        pipeline.advance(&mut dim, usize::MAX, &mut events);
        let report = pipeline.advance(&mut dim, usize::MAX, &mut events);

        assert_eq!(report.expired, 1);
        let entity = dim.entity(EntityId(1)).unwrap();
        assert!(entity.effect(BURN).is_none());
        assert!(entity.effect(REGEN).is_some());
        assert_eq!(entity.health.current, 90);
        assert_eq!(dim.active_effects(), 1);
    }

    #[test]
    fn test_budget_defers_round_robin() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(5, 16);
        let mut events = Vec::new();
        for target in 1..=5 {
            pipeline.apply(&mut dim, direct(BURN, target), &mut events);
        }

        let first = pipeline.advance(&mut dim, 2, &mut events);
        assert_eq!((first.processed, first.deferred), (2, 3));
        assert_eq!(dim.effect_cursor, Some(EntityId(3)));

        pipeline.advance(&mut dim, 2, &mut events);
        assert_eq!(dim.effect_cursor, Some(EntityId(5)));

        pipeline.advance(&mut dim, 2, &mut events);
        assert_eq!(dim.effect_cursor, Some(EntityId(2)));

        let remaining: Vec<u32> = (1..=5)
            .map(|i| dim.entity(EntityId(i)).unwrap().effect(BURN).map_or(0, |e| e.remaining_ticks))
            .collect();
        // Entity 1 was advanced twice and expired, the rest once.
        assert_eq!(remaining, vec![0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_cleanse_removes_harmful() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(1, 16);
        let mut events = Vec::new();
        pipeline.apply(&mut dim, direct(BURN, 1), &mut events);
        pipeline.apply(&mut dim, direct(REGEN, 1), &mut events);

        assert_eq!(pipeline.cleanse(&mut dim, EntityId(1), &mut events), 1);
        assert_eq!(dim.active_effects(), 1);
        assert!(dim.entity(EntityId(1)).unwrap().effect(REGEN).is_some());
    }

    #[test]
    fn test_area_partial_immunity() {
        let catalog = catalog();
        let pipeline = EffectPipeline::new(&catalog, 8);
        let mut dim = dimension(4, 16);
        let mut events = Vec::new();
        pipeline.apply(&mut dim, direct(WARD, 2), &mut events);

        let outcomes = pipeline.propagate_area(&mut dim, BURN, EntityId(99), Position::new(0.0, 0.0), 3.5, &mut events);
        assert_eq!(
            outcomes,
            vec![
                (EntityId(1), ApplyOutcome::Applied),
                (EntityId(2), ApplyOutcome::Immune),
                (EntityId(3), ApplyOutcome::Applied),
            ]
        );
    }
}
