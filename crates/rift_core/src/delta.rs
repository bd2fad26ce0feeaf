//! # State Deltas
//!
//! What changed in a dimension since the previous network tick, and the
//! binary codec used to put it on the wire.
//!
//! ## Wire Layout (little-endian)
//!
//! ```text
//! DeltaHeader            40 bytes
//! EntityUpdate  x n      24 bytes each
//! EffectUpdate  x m      12 bytes each
//! RiftUpdate    x k      24 bytes each
//! ```
//!
//! Every record is a `#[repr(C)]` Pod with no padding, so encoding is a
//! straight copy.

use bytemuck::{bytes_of, Pod, Zeroable};

use crate::arena::ArenaKey;
use crate::dimension::{Dimension, DimensionKind, DimensionState};
use crate::ids::{DimensionId, Tick};

/// Entity left the dimension.
pub const FLAG_REMOVED: u32 = 1;
/// Entity is at zero health.
pub const FLAG_DEFEATED: u32 = 1 << 1;

/// Changed entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct EntityUpdate {
    /// Entity id.
    pub entity: u32,
    /// `FLAG_*` bits.
    pub flags: u32,
    /// Current health.
    pub health: u32,
    /// Current energy.
    pub energy: u32,
    /// Position X.
    pub x: f32,
    /// Position Y.
    pub y: f32,
}

impl EntityUpdate {
    /// Returns true if the entity left the dimension.
    #[inline]
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.flags & FLAG_REMOVED != 0
    }
}

/// Active effect on a changed entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct EffectUpdate {
    /// Carrier.
    pub entity: u32,
    /// Template id.
    pub template: u16,
    /// Stack count.
    pub stacks: u16,
    /// Ticks left.
    pub remaining_ticks: u32,
}

/// A live rift.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RiftUpdate {
    /// Rift id.
    pub rift: u32,
    /// Ticks until decay.
    pub decay_ticks: u32,
    /// Center X.
    pub x: f32,
    /// Center Y.
    pub y: f32,
    /// Radius.
    pub radius: f32,
    /// Current impact.
    pub impact: f32,
}

/// Fixed-size prefix of an encoded delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct DeltaHeader {
    /// Simulation tick of the capture.
    pub tick: u64,
    /// Dimension slot index.
    pub dimension_index: u32,
    /// Dimension slot generation.
    pub dimension_generation: u32,
    /// Stability score.
    pub stability: f32,
    /// Number of entity records.
    pub entity_count: u32,
    /// Number of effect records.
    pub effect_count: u32,
    /// Number of rift records.
    pub rift_count: u32,
    /// Dimension state code.
    pub state: u8,
    /// Dimension kind code.
    pub kind: u8,
    /// Padding for alignment.
    pub _pad: [u8; 2],
    /// Collapse countdown (0 unless collapsing).
    pub countdown: u32,
}

/// Changes of one dimension since the previous network tick.
#[derive(Clone, Debug, PartialEq)]
pub struct StateDelta {
    /// Simulation tick of the capture.
    pub tick: Tick,
    /// Dimension.
    pub dimension: DimensionId,
    /// Dimension kind.
    pub kind: DimensionKind,
    /// Dimension state.
    pub state: DimensionState,
    /// Stability score.
    pub stability: f32,
    /// Changed and removed entities, in id order.
    pub entity_updates: Vec<EntityUpdate>,
    /// Effects of changed entities.
    pub effect_updates: Vec<EffectUpdate>,
    /// All live rifts.
    pub rifts: Vec<RiftUpdate>,
}

impl StateDelta {
    /// Builds the delta of `dim` and resets its change tracker.
    #[must_use]
    pub fn capture(dim: &mut Dimension, tick: Tick) -> Self {
        let tracker = std::mem::take(&mut dim.tracker);
        let mut entity_updates = Vec::with_capacity(tracker.entities.len() + tracker.removed.len());
        let mut effect_updates = Vec::new();

        for id in &tracker.entities {
            let Some(entity) = dim.entity(*id) else {
                continue;
            };
            entity_updates.push(EntityUpdate {
                entity: entity.id.0,
                flags: if entity.is_alive() { 0 } else { FLAG_DEFEATED },
                health: entity.health.current,
                energy: entity.energy.current,
                x: entity.position.x,
                y: entity.position.y,
            });
            effect_updates.extend(entity.effects.iter().map(|effect| EffectUpdate {
                entity: entity.id.0,
                template: effect.template.0,
                stacks: u16::from(effect.stacks),
                remaining_ticks: effect.remaining_ticks,
            }));
        }
        entity_updates.extend(tracker.removed.iter().map(|id| EntityUpdate {
            entity: id.0,
            flags: FLAG_REMOVED,
            ..EntityUpdate::default()
        }));
        entity_updates.sort_by_key(|u| u.entity);

        let rifts = dim
            .rifts()
            .iter()
            .map(|rift| RiftUpdate {
                rift: rift.id.0,
                decay_ticks: rift.decay_ticks,
                x: rift.position.x,
                y: rift.position.y,
                radius: rift.radius,
                impact: rift.impact,
            })
            .collect();

        Self {
            tick,
            dimension: dim.id(),
            kind: dim.kind(),
            state: dim.state(),
            stability: dim.stability(),
            entity_updates,
            effect_updates,
            rifts,
        }
    }

    /// Returns true if no entity or rift records are carried.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entity_updates.is_empty() && self.effect_updates.is_empty() && self.rifts.is_empty()
    }

    /// Encodes the delta.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = DeltaWriter::with_capacity(self.encoded_len());
        writer.write_delta(self);
        writer.into_bytes()
    }

    /// Decodes a delta. Returns `None` for truncated or malformed input.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        DeltaReader::new(bytes).read_delta()
    }

    /// Size of the encoded form.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        std::mem::size_of::<DeltaHeader>()
            + self.entity_updates.len() * std::mem::size_of::<EntityUpdate>()
            + self.effect_updates.len() * std::mem::size_of::<EffectUpdate>()
            + self.rifts.len() * std::mem::size_of::<RiftUpdate>()
    }

    fn header(&self) -> DeltaHeader {
        let countdown = match self.state {
            DimensionState::Collapsing { remaining_ticks } => u32::try_from(remaining_ticks).unwrap_or(u32::MAX),
            _ => 0,
        };
        DeltaHeader {
            tick: self.tick,
            dimension_index: self.dimension.index(),
            dimension_generation: self.dimension.generation(),
            stability: self.stability,
            entity_count: self.entity_updates.len() as u32,
            effect_count: self.effect_updates.len() as u32,
            rift_count: self.rifts.len() as u32,
            state: self.state.code(),
            kind: self.kind.code(),
            _pad: [0; 2],
            countdown,
        }
    }
}

/// Receives encoded deltas every network tick.
pub trait BroadcastSink {
    /// Hands one dimension's delta to the transport.
    fn broadcast(&mut self, delta: &StateDelta);
}

impl BroadcastSink for Vec<StateDelta> {
    fn broadcast(&mut self, delta: &StateDelta) {
        self.push(delta.clone());
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Writes deltas into a growable buffer.
#[derive(Debug, Default)]
pub struct DeltaWriter {
    buffer: Vec<u8>,
}

impl DeltaWriter {
    /// Creates a writer with `capacity` bytes reserved.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buffer: Vec::with_capacity(capacity) }
    }

    /// Bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes the writer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Writes a Pod type directly.
    #[inline]
    pub fn write_pod<T: Pod>(&mut self, value: &T) {
        self.buffer.extend_from_slice(bytes_of(value));
    }

    /// Writes a complete delta.
    pub fn write_delta(&mut self, delta: &StateDelta) {
        self.write_pod(&delta.header());
        for update in &delta.entity_updates {
            self.write_pod(update);
        }
        for update in &delta.effect_updates {
            self.write_pod(update);
        }
        for rift in &delta.rifts {
            self.write_pod(rift);
        }
    }
}

/// Reads deltas from a byte slice.
pub struct DeltaReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> DeltaReader<'a> {
    /// Creates a reader over `buffer`.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Reads a Pod type directly.
    #[inline]
    pub fn read_pod<T: Pod>(&mut self) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let slice = self.buffer.get(self.position..self.position + size)?;
        self.position += size;
        bytemuck::try_pod_read_unaligned(slice).ok()
    }

    fn read_records<T: Pod>(&mut self, count: u32) -> Option<Vec<T>> {
        let count = count as usize;
        if count.checked_mul(std::mem::size_of::<T>())? > self.remaining() {
            return None;
        }
        (0..count).map(|_| self.read_pod()).collect()
    }

    /// Reads a complete delta.
    pub fn read_delta(&mut self) -> Option<StateDelta> {
        let header: DeltaHeader = self.read_pod()?;
        let state = DimensionState::from_code(header.state, u64::from(header.countdown))?;
        let kind = DimensionKind::from_code(header.kind)?;
        let entity_updates = self.read_records(header.entity_count)?;
        let effect_updates = self.read_records(header.effect_count)?;
        let rifts = self.read_records(header.rift_count)?;

        Some(StateDelta {
            tick: header.tick,
            dimension: DimensionId(ArenaKey {
                index: header.dimension_index,
                generation: header.dimension_generation,
            }),
            kind,
            state,
            stability: header.stability,
            entity_updates,
            effect_updates,
            rifts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::RiftSpec;
    use crate::entity::{Entity, EntityProfile, Position};
    use crate::ids::EntityId;

    fn dimension() -> Dimension {
        let id = DimensionId(ArenaKey { index: 3, generation: 2 });
        let mut dim = Dimension::new(id, DimensionKind::Celestial, 8, 16, 0, false);
        for n in 1..=3 {
            let entity = Entity::from_profile(EntityId(n), id, Position::new(n as f32, 0.0), &EntityProfile::default());
            dim.admit(entity).unwrap();
        }
        dim
    }

    #[test]
    fn test_record_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<DeltaHeader>(), 40);
        assert_eq!(std::mem::size_of::<EntityUpdate>(), 24);
        assert_eq!(std::mem::size_of::<EffectUpdate>(), 12);
        assert_eq!(std::mem::size_of::<RiftUpdate>(), 24);
    }

    #[test]
    fn test_capture_resets_tracker() {
        let mut dim = dimension();
        let first = StateDelta::capture(&mut dim, 1);
        assert_eq!(first.entity_updates.len(), 3);
        assert!(!dim.tracker.has_changes());

        dim.remove_entity(EntityId(2));
        dim.entity_mut(EntityId(3)).unwrap().health.drain(40);
        let second = StateDelta::capture(&mut dim, 2);

        let flags: Vec<(u32, u32)> = second.entity_updates.iter().map(|u| (u.entity, u.flags)).collect();
        assert_eq!(flags, vec![(2, FLAG_REMOVED), (3, 0)]);
        assert!(second.entity_updates[0].is_removed());
        assert!(!second.entity_updates[1].is_removed());
        assert_eq!(second.entity_updates[1].health, 60);
    }

    #[test]
    fn test_codec_preserves_delta() {
        let mut dim = dimension();
        let spec = RiftSpec { impact: 0.1, radius: 2.0, growth_per_tick: 0.01, duration_ticks: 30 };
        dim.open_rift(&spec, Position::new(4.0, 4.0));
        let delta = StateDelta::capture(&mut dim, 77);

        let bytes = delta.encode();
        assert_eq!(bytes.len(), delta.encoded_len());
        assert_eq!(StateDelta::decode(&bytes), Some(delta));
    }

    #[test]
    fn test_truncated_input_is_refused() {
        let mut dim = dimension();
        let bytes = StateDelta::capture(&mut dim, 5).encode();
        assert!(StateDelta::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(StateDelta::decode(&bytes[..10]).is_none());
    }
}
