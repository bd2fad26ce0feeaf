//! # Identifiers
//!
//! Strongly-typed ids shared by every subsystem. Everything that crosses a
//! module boundary refers to other objects by id, never by pointer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::arena::ArenaKey;

/// Simulation tick counter.
pub type Tick = u64;

/// Identifier of a dimension (a generational arena key).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DimensionId(pub(crate) ArenaKey);

impl DimensionId {
    /// Slot index inside the dimension arena.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0.index
    }

    /// Generation of the slot when this id was issued.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.0.generation
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dim#{}.{}", self.0.index, self.0.generation)
    }
}

/// Identifier of an entity. Unique for the lifetime of the simulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Identifier of a static ability definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbilityId(pub u16);

/// Identifier of a static effect template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectTemplateId(pub u16);

/// Identifier of a rift, unique within its dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RiftId(pub u32);

/// Identifier of a player session (owned by the external session layer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// Identifier of a matchmaking ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(pub u64);

/// Identifier of a submitted ability invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvocationId(pub u64);
