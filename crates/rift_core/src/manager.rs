//! # Dimension Manager
//!
//! Owns every dimension. Creates them under the global cap, routes
//! invocations to the dimension holding the caster, and moves entities
//! between dimensions through a single migration queue.
//!
//! ## Ownership
//!
//! An entity is always in exactly one place: inside one dimension, or in the
//! migration queue. The directory records which.

use std::collections::{BTreeMap, VecDeque};

use crate::arena::Arena;
use crate::catalog::StatTable;
use crate::combat::AbilityInvocation;
use crate::config::DimensionLimits;
use crate::dimension::{Dimension, DimensionKind};
use crate::entity::{Entity, EntityProfile, Position};
use crate::error::{Rejection, RejectionResult};
use crate::events::{RiftCloseCause, SimEvent};
use crate::ids::{DimensionId, EntityId};
use crate::pipeline::EffectPipeline;

/// Where an entity currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Inside a dimension.
    In(DimensionId),
    /// Waiting in the migration queue.
    InTransit,
}

/// An entity waiting to be placed.
#[derive(Clone, Debug)]
struct Migration {
    entity: Entity,
    from: DimensionId,
}

/// Migration work done in one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Entities placed.
    pub migrated: usize,
    /// Entities still queued.
    pub deferred: usize,
}

/// Registry of all dimensions.
pub struct DimensionManager {
    dimensions: Arena<Dimension>,
    directory: BTreeMap<EntityId, Location>,
    migrations: VecDeque<Migration>,
    fallback: DimensionId,
    limits: DimensionLimits,
    seed: u64,
    next_entity: u32,
}

impl DimensionManager {
    /// Creates the manager and its fallback dimension.
    #[must_use]
    pub fn new(limits: &DimensionLimits, seed: u64) -> Self {
        let mut dimensions = Arena::with_capacity(limits.max_concurrent);
        let key = dimensions.insert_with(|key| {
            Dimension::new(
                DimensionId(key),
                limits.fallback_kind,
                limits.fallback_capacity,
                limits.max_concurrent_effects,
                seed,
                true,
            )
        });
        let fallback = DimensionId(key);
        tracing::info!(dimension = %fallback, kind = ?limits.fallback_kind, "fallback dimension created");

        Self {
            dimensions,
            directory: BTreeMap::new(),
            migrations: VecDeque::new(),
            fallback,
            limits: limits.clone(),
            seed,
            next_entity: 1,
        }
    }

    /// The fallback dimension.
    #[inline]
    #[must_use]
    pub const fn fallback(&self) -> DimensionId {
        self.fallback
    }

    /// Live dimensions, fallback included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    /// Always false: the fallback dimension is permanent.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Looks up a dimension.
    #[inline]
    #[must_use]
    pub fn get(&self, id: DimensionId) -> Option<&Dimension> {
        self.dimensions.get(id.0)
    }

    /// Looks up a dimension mutably.
    #[inline]
    pub fn get_mut(&mut self, id: DimensionId) -> Option<&mut Dimension> {
        self.dimensions.get_mut(id.0)
    }

    /// Dimensions in arena order.
    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter().map(|(_, d)| d)
    }

    /// Dimensions in arena order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Dimension> {
        self.dimensions.iter_mut().map(|(_, d)| d)
    }

    /// Where `entity` is.
    #[inline]
    #[must_use]
    pub fn locate(&self, entity: EntityId) -> Option<Location> {
        self.directory.get(&entity).copied()
    }

    /// Entities waiting in the migration queue.
    #[inline]
    #[must_use]
    pub fn pending_migrations(&self) -> usize {
        self.migrations.len()
    }

    /// Creates a dimension of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::DimensionCapReached`] at the global cap.
    pub fn create_dimension(&mut self, kind: DimensionKind) -> RejectionResult<DimensionId> {
        let cap = self.limits.max_concurrent;
        if self.dimensions.len() >= cap {
            return Err(Rejection::DimensionCapReached { cap });
        }
        let (capacity, ceiling, seed) = (
            self.limits.entity_capacity,
            self.limits.max_concurrent_effects,
            self.seed,
        );
        let key = self
            .dimensions
            .insert_with(|key| Dimension::new(DimensionId(key), kind, capacity, ceiling, seed, false));
        let id = DimensionId(key);
        tracing::info!(dimension = %id, ?kind, live = self.dimensions.len(), "dimension created");
        Ok(id)
    }

    /// Spawns one entity into `dimension`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownDimension`] or [`Rejection::DimensionFull`].
    pub fn spawn_entity(
        &mut self,
        dimension: DimensionId,
        position: Position,
        profile: &EntityProfile,
    ) -> RejectionResult<EntityId> {
        let id = EntityId(self.next_entity);
        let dim = self
            .dimensions
            .get_mut(dimension.0)
            .ok_or(Rejection::UnknownDimension(dimension))?;
        let capacity = dim.capacity();
        dim.admit(Entity::from_profile(id, dimension, position, profile))
            .map_err(|_| Rejection::DimensionFull { dimension, capacity })?;

        self.next_entity += 1;
        self.directory.insert(id, Location::In(dimension));
        Ok(id)
    }

    /// Finds a live, non-throttled regular dimension with room for `party_size`.
    #[must_use]
    pub fn find_admission(&self, party_size: usize, affinity: Option<DimensionKind>) -> Option<DimensionId> {
        self.iter()
            .filter(|d| !d.is_fallback() && d.state().is_live() && !d.state().is_throttled())
            .filter(|d| affinity.map_or(true, |kind| d.kind() == kind))
            .find(|d| d.free_capacity() >= party_size)
            .map(Dimension::id)
    }

    /// Places a party: into an existing dimension if one fits, otherwise a
    /// new one.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::DimensionCapReached`] when nothing fits and no
    /// dimension can be created, or [`Rejection::DimensionFull`] when the
    /// party is larger than a fresh dimension.
    pub fn admit_party(
        &mut self,
        party_size: usize,
        affinity: Option<DimensionKind>,
        stats: &StatTable,
    ) -> RejectionResult<(DimensionId, Vec<EntityId>)> {
        let dimension = match self.find_admission(party_size, affinity) {
            Some(id) => id,
            None if party_size > self.limits.entity_capacity => {
                return Err(Rejection::DimensionFull {
                    dimension: self.fallback,
                    capacity: self.limits.entity_capacity,
                });
            }
            None => self.create_dimension(affinity.unwrap_or(DimensionKind::Physical))?,
        };

        let mut members = Vec::with_capacity(party_size);
        for _ in 0..party_size {
            let dim = self
                .dimensions
                .get_mut(dimension.0)
                .ok_or(Rejection::UnknownDimension(dimension))?;
            let kind = dim.kind();
            let position = dim.random_position();
            members.push(self.spawn_entity(dimension, position, stats.profile_for(kind))?);
        }
        Ok((dimension, members))
    }

    /// Routes an invocation to the dimension holding its caster.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownEntity`] for unknown casters, or
    /// [`Rejection::InvalidTarget`] when the caster is migrating or the
    /// invocation names another dimension.
    pub fn route(&self, invocation: &AbilityInvocation) -> RejectionResult<DimensionId> {
        match self.locate(invocation.caster) {
            None => Err(Rejection::UnknownEntity(invocation.caster)),
            Some(Location::InTransit) => Err(Rejection::InvalidTarget {
                target: Some(invocation.caster),
                reason: "caster is migrating",
            }),
            Some(Location::In(dimension)) if dimension != invocation.dimension => Err(Rejection::InvalidTarget {
                target: Some(invocation.caster),
                reason: "caster is not in the named dimension",
            }),
            Some(Location::In(dimension)) => Ok(dimension),
        }
    }

    /// Hands evacuated entities to the migration queue.
    pub fn enqueue_evacuees(&mut self, from: DimensionId, evacuees: Vec<Entity>) {
        for entity in evacuees {
            self.directory.insert(entity.id, Location::InTransit);
            self.migrations.push_back(Migration { entity, from });
        }
    }

    /// Frees the slot of a collapsed dimension.
    pub fn release(&mut self, id: DimensionId) -> Option<Dimension> {
        if id == self.fallback {
            return None;
        }
        let released = self.dimensions.remove(id.0)?;
        tracing::info!(dimension = %id, live = self.dimensions.len(), "dimension released");
        Some(released)
    }

    /// Evacuates and releases a dimension on request.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownDimension`] for stale ids and
    /// [`Rejection::InvalidTarget`] for the fallback dimension.
    pub fn teardown(
        &mut self,
        id: DimensionId,
        pipeline: &EffectPipeline<'_>,
        events: &mut Vec<SimEvent>,
    ) -> RejectionResult<Dimension> {
        if id == self.fallback {
            return Err(Rejection::InvalidTarget { target: None, reason: "fallback dimension cannot be torn down" });
        }
        let dim = self.get_mut(id).ok_or(Rejection::UnknownDimension(id))?;
        let evacuees = evacuate(dim, pipeline, events);
        self.enqueue_evacuees(id, evacuees);
        self.release(id).ok_or(Rejection::UnknownDimension(id))
    }

    /// Places queued entities, at most `limit` this tick.
    ///
    /// Each entity goes to the fallback dimension if it has room, otherwise
    /// to the first dimension matchmaking would admit into. Entities that fit
    /// nowhere stay queued, in order.
    pub fn process_migrations(&mut self, limit: usize, events: &mut Vec<SimEvent>) -> MigrationReport {
        let mut migrated = 0;
        while migrated < limit {
            let Some(Migration { entity, from }) = self.migrations.pop_front() else {
                break;
            };
            let Some(dim) = self.migration_target().and_then(|target| self.dimensions.get_mut(target.0)) else {
                self.migrations.push_front(Migration { entity, from });
                break;
            };
            let (id, target) = (entity.id, dim.id());
            if let Err(entity) = dim.admit(entity) {
                self.migrations.push_front(Migration { entity: *entity, from });
                break;
            }
            self.directory.insert(id, Location::In(target));
            events.push(SimEvent::EntityMigrated { entity: id, from, to: target });
            migrated += 1;
        }

        let deferred = self.migrations.len();
        if deferred > 0 {
            tracing::warn!(migrated, deferred, limit, "migrations deferred to next tick");
        }
        MigrationReport { migrated, deferred }
    }

    fn migration_target(&self) -> Option<DimensionId> {
        if self.get(self.fallback).is_some_and(|d| d.free_capacity() > 0) {
            return Some(self.fallback);
        }
        self.find_admission(1, None)
    }
}

/// Clears a dimension and empties it: effects end, rifts drop, entities are
/// handed back in id order and the dimension becomes `Collapsed`.
pub fn evacuate(dim: &mut Dimension, pipeline: &EffectPipeline<'_>, events: &mut Vec<SimEvent>) -> Vec<Entity> {
    let dimension = dim.id();
    pipeline.clear_dimension(dim, events);
    events.extend(dim.clear_rifts().into_iter().map(|rift| SimEvent::RiftClosed {
        dimension,
        rift,
        cause: RiftCloseCause::Released,
    }));
    let evacuees = dim.drain_entities();
    if let Some((from, to)) = dim.mark_collapsed() {
        tracing::info!(%dimension, evacuees = evacuees.len(), "dimension collapsed");
        events.push(SimEvent::DimensionStateChanged { dimension, from, to, stability: dim.stability() });
    }
    evacuees
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::dimension::DimensionState;
    use crate::ids::InvocationId;
    use crate::stability::{StabilityWeights, Thresholds};

    fn limits(max: usize, capacity: usize, fallback: usize) -> DimensionLimits {
        DimensionLimits {
            max_concurrent: max,
            entity_capacity: capacity,
            fallback_capacity: fallback,
            ..DimensionLimits::default()
        }
    }

    #[test]
    fn test_global_cap_counts_fallback() {
        let mut manager = DimensionManager::new(&limits(2, 4, 4), 0);
        assert!(manager.create_dimension(DimensionKind::Void).is_ok());
        assert_eq!(
            manager.create_dimension(DimensionKind::Void),
            Err(Rejection::DimensionCapReached { cap: 2 })
        );
    }

    #[test]
    fn test_admission_prefers_existing_then_creates() {
        let stats = StatTable::default();
        let mut manager = DimensionManager::new(&limits(4, 4, 4), 0);

        let (first, party) = manager.admit_party(3, Some(DimensionKind::Astral), &stats).unwrap();
        assert_eq!(party.len(), 3);
        assert_eq!(manager.get(first).unwrap().kind(), DimensionKind::Astral);

        let (same, _) = manager.admit_party(1, Some(DimensionKind::Astral), &stats).unwrap();
        assert_eq!(same, first);

        let (other, _) = manager.admit_party(1, Some(DimensionKind::Astral), &stats).unwrap();
        assert_ne!(other, first);
        assert_eq!(manager.locate(party[0]), Some(Location::In(first)));
    }

    #[test]
    fn test_route_checks_named_dimension() {
        let stats = StatTable::default();
        let mut manager = DimensionManager::new(&limits(4, 4, 4), 0);
        let (dim, party) = manager.admit_party(1, None, &stats).unwrap();

        let mut invocation = AbilityInvocation {
            id: InvocationId(1),
            caster: party[0],
            ability: crate::ids::AbilityId(1),
            targets: Vec::new(),
            dimension: dim,
            tick_submitted: 0,
        };
        assert_eq!(manager.route(&invocation), Ok(dim));

        invocation.dimension = manager.fallback();
        assert!(matches!(manager.route(&invocation), Err(Rejection::InvalidTarget { .. })));

        invocation.caster = EntityId(999);
        assert_eq!(manager.route(&invocation), Err(Rejection::UnknownEntity(EntityId(999))));
    }

    #[test]
    fn test_teardown_migrates_within_budget() {
        let catalog = Catalog::default();
        let pipeline = EffectPipeline::new(&catalog, 4);
        let stats = StatTable::default();
        let mut manager = DimensionManager::new(&limits(4, 8, 2), 0);
        let (dim, party) = manager.admit_party(5, None, &stats).unwrap();
        let mut events = Vec::new();

        let released = manager.teardown(dim, &pipeline, &mut events).unwrap();
        assert_eq!(released.state(), DimensionState::Collapsed);
        assert!(manager.get(dim).is_none());
        assert_eq!(manager.pending_migrations(), 5);
        assert_eq!(manager.locate(party[0]), Some(Location::InTransit));

        // Fallback holds two; nothing else is live.
        let report = manager.process_migrations(10, &mut events);
        assert_eq!(report, MigrationReport { migrated: 2, deferred: 3 });

        manager.create_dimension(DimensionKind::Void).unwrap();
        let report = manager.process_migrations(2, &mut events);
        assert_eq!(report, MigrationReport { migrated: 2, deferred: 1 });

        let report = manager.process_migrations(2, &mut events);
        assert_eq!(report, MigrationReport { migrated: 1, deferred: 0 });

        let placed: usize = manager.iter().map(Dimension::entity_count).sum();
        assert_eq!(placed, 5);
        assert!(party.iter().all(|&e| matches!(manager.locate(e), Some(Location::In(_)))));
    }

    #[test]
    fn test_evacuees_never_land_in_collapsing_dimension() {
        let catalog = Catalog::default();
        let pipeline = EffectPipeline::new(&catalog, 4);
        let profile = EntityProfile::default();
        let mut manager = DimensionManager::new(&limits(4, 4, 1), 0);
        let fallback = manager.fallback();
        manager.spawn_entity(fallback, Position::default(), &profile).unwrap();

        let doomed = manager.create_dimension(DimensionKind::Void).unwrap();
        let weights = StabilityWeights { effect_density: 0.0, entity_load: 0.0 };
        let thresholds = Thresholds { warning: 0.4, critical: 0.2, recovery: 0.3 };
        let change = manager.get_mut(doomed).unwrap().evaluate(1.0, &weights, &thresholds, 100);
        assert!(matches!(change, Some((_, DimensionState::Collapsing { .. }))));

        let source = manager.create_dimension(DimensionKind::Physical).unwrap();
        let evacuee = manager.spawn_entity(source, Position::default(), &profile).unwrap();
        let mut events = Vec::new();
        manager.teardown(source, &pipeline, &mut events).unwrap();
        events.clear();

        let report = manager.process_migrations(10, &mut events);
        assert_eq!(report, MigrationReport { migrated: 0, deferred: 1 });
        assert!(events.is_empty());
        assert_eq!(manager.get(doomed).unwrap().entity_count(), 0);
        assert_eq!(manager.locate(evacuee), Some(Location::InTransit));

        let haven = manager.create_dimension(DimensionKind::Physical).unwrap();
        let report = manager.process_migrations(10, &mut events);
        assert_eq!(report, MigrationReport { migrated: 1, deferred: 0 });
        assert_eq!(manager.locate(evacuee), Some(Location::In(haven)));
    }

    #[test]
    fn test_stale_id_after_release() {
        let catalog = Catalog::default();
        let pipeline = EffectPipeline::new(&catalog, 4);
        let mut manager = DimensionManager::new(&limits(4, 4, 4), 0);
        let old = manager.create_dimension(DimensionKind::Void).unwrap();
        manager.teardown(old, &pipeline, &mut Vec::new()).unwrap();

        let new = manager.create_dimension(DimensionKind::Void).unwrap();
        assert_eq!(old.index(), new.index());
        assert!(manager.get(old).is_none());
        assert_eq!(
            manager.teardown(old, &pipeline, &mut Vec::new()).err(),
            Some(Rejection::UnknownDimension(old))
        );
    }
}
