//! # Dimensions
//!
//! A dimension is an isolated combat space: it owns its entities, its rifts
//! and its RNG. All mutation inside one dimension during a tick is
//! single-threaded; different dimensions tick in parallel.
//!
//! ## State Machine
//!
//! ```text
//! Initializing ──► Stable ◄──► Unstable
//!                    ▲   \        │
//!                    │    ▼       ▼
//!                    └── Collapsing ──► Collapsed (terminal)
//! ```
//!
//! - **Unstable**: stability below `warning`. Rift-causing abilities are
//!   throttled; nobody is evicted.
//! - **Collapsing**: stability at or below `critical`. A countdown runs; if
//!   stability reaches `recovery` before it ends the dimension returns to
//!   Stable, otherwise every entity is evacuated and the dimension is
//!   released.
//! - The fallback dimension never collapses; its state bottoms out at
//!   Unstable.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use crate::ability::RiftSpec;
use crate::entity::{Entity, Position};
use crate::ids::{DimensionId, EntityId, RiftId};
use crate::stability::{self, StabilityInputs, StabilityWeights, Thresholds};

/// Side length of the square spawn area.
const SPAWN_EXTENT: f32 = 32.0;

/// Dimension types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DimensionKind {
    /// Baseline reality.
    Physical,
    /// Spirit plane.
    Ethereal,
    /// The void.
    Void,
    /// Celestial plane.
    Celestial,
    /// Astral plane.
    Astral,
}

impl DimensionKind {
    /// Wire code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Physical => 0,
            Self::Ethereal => 1,
            Self::Void => 2,
            Self::Celestial => 3,
            Self::Astral => 4,
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Physical),
            1 => Some(Self::Ethereal),
            2 => Some(Self::Void),
            3 => Some(Self::Celestial),
            4 => Some(Self::Astral),
            _ => None,
        }
    }
}

/// Lifecycle state of a dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DimensionState {
    /// Created, not yet evaluated.
    Initializing,
    /// Healthy.
    Stable,
    /// Below the warning threshold; throttled.
    Unstable,
    /// Below the critical threshold; evacuated when the countdown ends.
    Collapsing {
        /// Ticks left before evacuation.
        remaining_ticks: u64,
    },
    /// Terminal. Resources released.
    Collapsed,
}

impl DimensionState {
    /// Wire code (countdown not included).
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Stable => 1,
            Self::Unstable => 2,
            Self::Collapsing { .. } => 3,
            Self::Collapsed => 4,
        }
    }

    /// Rebuilds a state from its wire code and countdown.
    #[must_use]
    pub const fn from_code(code: u8, remaining_ticks: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Initializing),
            1 => Some(Self::Stable),
            2 => Some(Self::Unstable),
            3 => Some(Self::Collapsing { remaining_ticks }),
            4 => Some(Self::Collapsed),
            _ => None,
        }
    }

    /// Rift-causing abilities are denied in these states.
    #[inline]
    #[must_use]
    pub const fn is_throttled(self) -> bool {
        matches!(self, Self::Unstable | Self::Collapsing { .. })
    }

    /// Returns true for every state but `Collapsed`.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Collapsed)
    }

    /// Next state for a freshly computed stability score.
    ///
    /// `collapsible` is false for the fallback dimension.
    #[must_use]
    pub fn next(self, stability: f32, thresholds: &Thresholds, countdown_ticks: u64, collapsible: bool) -> Self {
        match self {
            Self::Collapsed => Self::Collapsed,
            Self::Collapsing { .. } if stability >= thresholds.recovery => Self::Stable,
            Self::Collapsing { remaining_ticks } => Self::Collapsing { remaining_ticks },
            Self::Initializing | Self::Stable | Self::Unstable => {
                if stability <= thresholds.critical && collapsible {
                    Self::Collapsing { remaining_ticks: countdown_ticks }
                } else if stability < thresholds.warning {
                    Self::Unstable
                } else {
                    Self::Stable
                }
            }
        }
    }
}

/// A transient anomaly that erodes stability while it lives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rift {
    /// Rift id (unique within the dimension).
    pub id: RiftId,
    /// Center.
    pub position: Position,
    /// Radius.
    pub radius: f32,
    /// Current stability impact.
    pub impact: f32,
    /// Impact added every tick.
    pub growth_per_tick: f32,
    /// Ticks until the rift closes on its own.
    pub decay_ticks: u32,
}

impl Rift {
    /// Grows and decays the rift by one tick. Returns false once it has closed.
    pub fn advance(&mut self) -> bool {
        self.impact += self.growth_per_tick;
        self.decay_ticks = self.decay_ticks.saturating_sub(1);
        self.decay_ticks > 0
    }
}

/// What changed since the last network delta.
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    pub(crate) entities: BTreeSet<EntityId>,
    pub(crate) removed: BTreeSet<EntityId>,
    pub(crate) header: bool,
}

impl ChangeTracker {
    pub(crate) fn has_changes(&self) -> bool {
        self.header || !self.entities.is_empty() || !self.removed.is_empty()
    }
}

/// A dimension and everything it owns.
pub struct Dimension {
    id: DimensionId,
    kind: DimensionKind,
    state: DimensionState,
    stability: f32,
    capacity: usize,
    effect_ceiling: usize,
    is_fallback: bool,
    entities: BTreeMap<EntityId, Entity>,
    rifts: Vec<Rift>,
    /// Live effect instances across all entities (stacks not counted).
    pub(crate) active_effects: usize,
    next_rift_id: u32,
    pub(crate) rng: ChaCha8Rng,
    /// Set by any mutation; cleared when stability is recomputed.
    stability_dirty: bool,
    pub(crate) tracker: ChangeTracker,
    /// First entity whose effect timers were not advanced last tick.
    pub(crate) effect_cursor: Option<EntityId>,
}

impl Dimension {
    /// Creates an empty dimension in `Initializing`.
    #[must_use]
    pub fn new(
        id: DimensionId,
        kind: DimensionKind,
        capacity: usize,
        effect_ceiling: usize,
        world_seed: u64,
        is_fallback: bool,
    ) -> Self {
        let key = (u64::from(id.index()) << 32) | u64::from(id.generation());
        let seed = world_seed ^ key.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self {
            id,
            kind,
            state: DimensionState::Initializing,
            stability: 1.0,
            capacity,
            effect_ceiling,
            is_fallback,
            entities: BTreeMap::new(),
            rifts: Vec::new(),
            active_effects: 0,
            next_rift_id: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stability_dirty: true,
            tracker: ChangeTracker { header: true, ..ChangeTracker::default() },
            effect_cursor: None,
        }
    }

    /// Dimension id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> DimensionId {
        self.id
    }

    /// Dimension type.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> DimensionKind {
        self.kind
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> DimensionState {
        self.state
    }

    /// Last computed stability score.
    #[inline]
    #[must_use]
    pub const fn stability(&self) -> f32 {
        self.stability
    }

    /// Entity capacity.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Active effect instance ceiling.
    #[inline]
    #[must_use]
    pub const fn effect_ceiling(&self) -> usize {
        self.effect_ceiling
    }

    /// Live effect instances.
    #[inline]
    #[must_use]
    pub const fn active_effects(&self) -> usize {
        self.active_effects
    }

    /// Returns true for the fallback dimension.
    #[inline]
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    /// Entities present.
    #[inline]
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Remaining entity slots.
    #[inline]
    #[must_use]
    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.entities.len())
    }

    /// Looks up an entity.
    #[inline]
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Looks up an entity mutably and marks it changed.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let entity = self.entities.get_mut(&id)?;
        self.tracker.entities.insert(id);
        self.stability_dirty = true;
        Some(entity)
    }

    /// Mutable access without change tracking. Callers report changes with
    /// [`Dimension::mark_entity_changed`].
    pub(crate) fn entity_slot(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub(crate) fn mark_entity_changed(&mut self, id: EntityId) {
        self.tracker.entities.insert(id);
        self.stability_dirty = true;
    }

    /// Entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entity ids in id order.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Live rifts.
    #[inline]
    #[must_use]
    pub fn rifts(&self) -> &[Rift] {
        &self.rifts
    }

    /// Ids of living entities within `radius` of `center`, in id order.
    #[must_use]
    pub fn entities_within(&self, center: Position, radius: f32, exclude: Option<EntityId>) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.is_alive() && Some(e.id) != exclude)
            .filter(|e| e.position.distance(center) <= radius)
            .map(|e| e.id)
            .collect()
    }

    /// Places an entity, giving it back if the dimension is full or gone.
    ///
    /// # Errors
    ///
    /// Returns the entity unchanged when there is no room.
    pub fn admit(&mut self, mut entity: Entity) -> Result<(), Box<Entity>> {
        if !self.state.is_live() || self.free_capacity() == 0 {
            return Err(Box::new(entity));
        }
        entity.dimension = self.id;
        self.active_effects += entity.effects.len();
        self.tracker.entities.insert(entity.id);
        self.tracker.removed.remove(&entity.id);
        self.stability_dirty = true;
        self.entities.insert(entity.id, entity);
        Ok(())
    }

    /// Removes an entity, releasing its effect slots.
    pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        self.active_effects -= entity.effects.len();
        self.tracker.entities.remove(&id);
        self.tracker.removed.insert(id);
        self.stability_dirty = true;
        if self.effect_cursor == Some(id) {
            self.effect_cursor = self.entities.range(id..).next().map(|(&next, _)| next);
        }
        Some(entity)
    }

    /// Removes every entity, in id order.
    pub fn drain_entities(&mut self) -> Vec<Entity> {
        let ids = self.entity_ids();
        ids.into_iter().filter_map(|id| self.remove_entity(id)).collect()
    }

    /// Uniform random spawn position from the dimension RNG.
    pub fn random_position(&mut self) -> Position {
        Position::new(
            self.rng.gen_range(0.0..SPAWN_EXTENT),
            self.rng.gen_range(0.0..SPAWN_EXTENT),
        )
    }

    /// Opens a rift at `position`.
    pub fn open_rift(&mut self, spec: &RiftSpec, position: Position) -> RiftId {
        let id = RiftId(self.next_rift_id);
        self.next_rift_id = self.next_rift_id.wrapping_add(1);
        self.rifts.push(Rift {
            id,
            position,
            radius: spec.radius,
            impact: spec.impact,
            growth_per_tick: spec.growth_per_tick,
            decay_ticks: spec.duration_ticks.max(1),
        });
        self.mark_header_changed();
        id
    }

    /// Closes every rift whose center lies within `radius` of `center`.
    pub fn close_rifts_within(&mut self, center: Position, radius: f32) -> Vec<RiftId> {
        let mut closed = Vec::new();
        self.rifts.retain(|rift| {
            let inside = rift.position.distance(center) <= radius;
            if inside {
                closed.push(rift.id);
            }
            !inside
        });
        if !closed.is_empty() {
            self.mark_header_changed();
        }
        closed
    }

    /// Grows and decays every rift. Returns the ids of rifts that closed.
    pub fn advance_rifts(&mut self) -> Vec<RiftId> {
        if self.rifts.is_empty() {
            return Vec::new();
        }
        let mut closed = Vec::new();
        self.rifts.retain_mut(|rift| {
            let open = rift.advance();
            if !open {
                closed.push(rift.id);
            }
            open
        });
        self.mark_header_changed();
        closed
    }

    /// Drops every rift. Returns their ids.
    pub fn clear_rifts(&mut self) -> Vec<RiftId> {
        if !self.rifts.is_empty() {
            self.mark_header_changed();
        }
        self.rifts.drain(..).map(|r| r.id).collect()
    }

    /// Sum of live rift impacts.
    #[must_use]
    pub fn rift_impact(&self) -> f32 {
        self.rifts.iter().map(|r| r.impact).sum()
    }

    /// Returns true if anything changed since stability was last computed.
    #[inline]
    #[must_use]
    pub const fn needs_evaluation(&self) -> bool {
        self.stability_dirty
    }

    pub(crate) fn mark_header_changed(&mut self) {
        self.tracker.header = true;
        self.stability_dirty = true;
    }

    /// Recomputes stability and runs the state machine.
    ///
    /// Returns `(from, to)` when the state changed phase.
    pub fn evaluate(
        &mut self,
        destabilization: f32,
        weights: &StabilityWeights,
        thresholds: &Thresholds,
        countdown_ticks: u64,
    ) -> Option<(DimensionState, DimensionState)> {
        let inputs = StabilityInputs {
            rift_impact: self.rift_impact(),
            destabilization,
            active_effects: self.active_effects,
            effect_ceiling: self.effect_ceiling,
            entity_count: self.entities.len(),
            entity_capacity: self.capacity,
        };
        let score = stability::compute(&inputs, weights);
        self.stability_dirty = false;
        if score.to_bits() != self.stability.to_bits() {
            self.stability = score;
            self.tracker.header = true;
        }

        let next = self.state.next(score, thresholds, countdown_ticks, !self.is_fallback);
        self.transition(next)
    }

    /// Runs one tick of the collapse countdown.
    ///
    /// Returns true when the countdown has run out.
    pub fn tick_countdown(&mut self) -> bool {
        if let DimensionState::Collapsing { remaining_ticks } = &mut self.state {
            *remaining_ticks = remaining_ticks.saturating_sub(1);
            self.tracker.header = true;
            return *remaining_ticks == 0;
        }
        false
    }

    /// Forces the terminal state. Entities must already be gone.
    pub(crate) fn mark_collapsed(&mut self) -> Option<(DimensionState, DimensionState)> {
        self.transition(DimensionState::Collapsed)
    }

    fn transition(&mut self, next: DimensionState) -> Option<(DimensionState, DimensionState)> {
        let previous = self.state;
        self.state = next;
        if previous.code() == next.code() {
            return None;
        }
        self.tracker.header = true;
        Some((previous, next))
    }

    /// Order-sensitive hash of the observable dimension state.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.state.hash(&mut hasher);
        self.stability.to_bits().hash(&mut hasher);
        self.active_effects.hash(&mut hasher);
        for entity in self.entities.values() {
            entity.id.hash(&mut hasher);
            entity.position.x.to_bits().hash(&mut hasher);
            entity.position.y.to_bits().hash(&mut hasher);
            entity.health.current.hash(&mut hasher);
            entity.energy.current.hash(&mut hasher);
            entity.effects.hash(&mut hasher);
            entity.cooldowns.hash(&mut hasher);
        }
        for rift in &self.rifts {
            rift.id.hash(&mut hasher);
            rift.impact.to_bits().hash(&mut hasher);
            rift.decay_ticks.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::entity::EntityProfile;

    const THRESHOLDS: Thresholds = Thresholds { warning: 0.4, critical: 0.2, recovery: 0.3 };
    const NO_WEIGHTS: StabilityWeights = StabilityWeights { effect_density: 0.0, entity_load: 0.0 };

    fn dim_id(index: u32) -> DimensionId {
        DimensionId(ArenaKey { index, generation: 0 })
    }

    fn dimension(capacity: usize) -> Dimension {
        Dimension::new(dim_id(0), DimensionKind::Void, capacity, 16, 42, false)
    }

    fn spawn(dim: &mut Dimension, id: u32) {
        let entity = Entity::from_profile(EntityId(id), dim.id(), Position::default(), &EntityProfile::default());
        assert!(dim.admit(entity).is_ok());
    }

    fn rift(impact: f32, growth: f32, ticks: u32) -> RiftSpec {
        RiftSpec { impact, radius: 1.0, growth_per_tick: growth, duration_ticks: ticks }
    }

    #[test]
    fn test_state_machine_bands() {
        use DimensionState::*;
        assert_eq!(Initializing.next(0.9, &THRESHOLDS, 10, true), Stable);
        assert_eq!(Stable.next(0.25, &THRESHOLDS, 10, true), Unstable);
        assert_eq!(Unstable.next(0.5, &THRESHOLDS, 10, true), Stable);
        assert_eq!(Unstable.next(0.2, &THRESHOLDS, 10, true), Collapsing { remaining_ticks: 10 });
        assert_eq!(Collapsing { remaining_ticks: 4 }.next(0.25, &THRESHOLDS, 10, true), Collapsing { remaining_ticks: 4 });
        assert_eq!(Collapsing { remaining_ticks: 4 }.next(0.3, &THRESHOLDS, 10, true), Stable);
        assert_eq!(Collapsed.next(1.0, &THRESHOLDS, 10, true), Collapsed);
    }

    #[test]
    fn test_fallback_never_collapses() {
        let state = DimensionState::Stable.next(0.0, &THRESHOLDS, 10, false);
        assert_eq!(state, DimensionState::Unstable);
    }

    #[test]
    fn test_capacity_enforced_on_admit() {
        let mut dim = dimension(2);
        spawn(&mut dim, 1);
        spawn(&mut dim, 2);

        let extra = Entity::from_profile(EntityId(3), dim.id(), Position::default(), &EntityProfile::default());
        let returned = dim.admit(extra).unwrap_err();
        assert_eq!(returned.id, EntityId(3));
        assert_eq!(dim.entity_count(), 2);
    }

    #[test]
    fn test_rift_growth_and_decay() {
        let mut dim = dimension(4);
        dim.open_rift(&rift(0.1, 0.05, 2), Position::default());

        assert!(dim.advance_rifts().is_empty());
        assert!((dim.rift_impact() - 0.15).abs() < 1e-6);

        let closed = dim.advance_rifts();
        assert_eq!(closed, vec![RiftId(0)]);
        assert!(dim.rifts().is_empty());
    }

    #[test]
    fn test_seal_closes_only_nearby_rifts() {
        let mut dim = dimension(4);
        dim.open_rift(&rift(0.1, 0.0, 100), Position::new(0.0, 0.0));
        dim.open_rift(&rift(0.1, 0.0, 100), Position::new(50.0, 50.0));

        let closed = dim.close_rifts_within(Position::new(1.0, 1.0), 3.0);
        assert_eq!(closed, vec![RiftId(0)]);
        assert_eq!(dim.rifts().len(), 1);
    }

    #[test]
    fn test_evaluate_collapse_and_countdown() {
        let mut dim = dimension(4);
        dim.open_rift(&rift(0.85, 0.0, 1000), Position::default());

        let change = dim.evaluate(0.0, &NO_WEIGHTS, &THRESHOLDS, 2);
        assert_eq!(change, Some((DimensionState::Initializing, DimensionState::Collapsing { remaining_ticks: 2 })));
        assert!(!dim.needs_evaluation());

        assert!(!dim.tick_countdown());
        assert!(dim.tick_countdown());
    }

    #[test]
    fn test_removed_entity_advances_cursor() {
        let mut dim = dimension(4);
        for id in 1..=3 {
            spawn(&mut dim, id);
        }
        dim.effect_cursor = Some(EntityId(2));
        dim.remove_entity(EntityId(2));
        assert_eq!(dim.effect_cursor, Some(EntityId(3)));
    }

    #[test]
    fn test_digest_tracks_state() {
        let mut a = dimension(4);
        let mut b = dimension(4);
        spawn(&mut a, 1);
        spawn(&mut b, 1);
        assert_eq!(a.digest(), b.digest());

        if let Some(e) = b.entity_mut(EntityId(1)) {
            e.health.drain(1);
        }
        assert_ne!(a.digest(), b.digest());
    }
}
