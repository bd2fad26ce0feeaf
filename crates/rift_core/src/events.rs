//! # Simulation Events
//!
//! Everything observable that happens inside a tick is reported as a
//! [`SimEvent`]. Events of one tick are published in deterministic order:
//! dimension arena order, then the order they occurred inside the dimension,
//! then cross-dimension work (migrations, matchmaking).
//!
//! ## Event Flow for an Area Hex:
//! ```text
//! 1. SubmitHandle::invoke           (any thread)
//! 2. Simulation drains at tick start
//! 3. CombatResolver commit          -> AbilityResolved
//! 4. EffectPipeline per target      -> EffectApplied / EffectDropped /
//!                                      EffectCapacityExceeded
//! 5. Stability recompute            -> DimensionStateChanged
//! 6. EventChannel                   -> monitoring / replay collaborator
//! ```

use crate::dimension::DimensionState;
use crate::error::Rejection;
use crate::ids::{
    AbilityId, DimensionId, EffectTemplateId, EntityId, InvocationId, RiftId, SessionId, Tick,
    TicketId,
};

/// Why an effect instance ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryCause {
    /// Duration ran out.
    Duration,
    /// Removed by a cleanse ability.
    Cleansed,
    /// Cleared by dimension collapse or teardown.
    Cleared,
}

/// Why an application was dropped without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Target already at the template's stack cap.
    StackCapped,
    /// Target immune (static immunity or active ward).
    Immune,
    /// Chain depth limit reached.
    ChainDepth,
    /// Target gone or dead.
    TargetMissing,
}

/// Why a rift closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiftCloseCause {
    /// Decay timer ran out.
    Decayed,
    /// Closed by a seal ability.
    Sealed,
    /// Dropped with its dimension.
    Released,
}

/// Something observable that happened during a tick.
#[derive(Clone, Debug, PartialEq)]
pub enum SimEvent {
    /// An invocation was committed.
    AbilityResolved {
        /// Dimension it resolved in.
        dimension: DimensionId,
        /// Invocation id.
        invocation: InvocationId,
        /// Caster.
        caster: EntityId,
        /// Ability.
        ability: AbilityId,
        /// Resolved targets.
        targets: Vec<EntityId>,
        /// Total direct damage dealt.
        damage: u32,
        /// Total healing done.
        healing: u32,
    },

    /// An invocation was refused.
    AbilityRejected {
        /// Invocation id.
        invocation: InvocationId,
        /// Caster.
        caster: EntityId,
        /// Ability.
        ability: AbilityId,
        /// Why.
        reason: Rejection,
    },

    /// An effect landed (new instance or extra stack).
    EffectApplied {
        /// Dimension.
        dimension: DimensionId,
        /// Target.
        target: EntityId,
        /// Source.
        source: EntityId,
        /// Template.
        template: EffectTemplateId,
        /// Stack count after the application.
        stacks: u8,
        /// Chain depth of the application.
        depth: u32,
    },

    /// An effect instance ended.
    EffectExpired {
        /// Dimension.
        dimension: DimensionId,
        /// Entity that carried it.
        target: EntityId,
        /// Template.
        template: EffectTemplateId,
        /// Why it ended.
        cause: ExpiryCause,
    },

    /// An application was dropped without error.
    EffectDropped {
        /// Dimension.
        dimension: DimensionId,
        /// Intended target.
        target: EntityId,
        /// Template.
        template: EffectTemplateId,
        /// Why.
        reason: DropReason,
    },

    /// A new instance was refused because the dimension is at its ceiling.
    EffectCapacityExceeded {
        /// Dimension.
        dimension: DimensionId,
        /// Intended target.
        target: EntityId,
        /// Template.
        template: EffectTemplateId,
        /// Configured ceiling.
        ceiling: usize,
    },

    /// A rift opened.
    RiftOpened {
        /// Dimension.
        dimension: DimensionId,
        /// Rift id.
        rift: RiftId,
        /// Initial impact.
        impact: f32,
    },

    /// A rift closed.
    RiftClosed {
        /// Dimension.
        dimension: DimensionId,
        /// Rift id.
        rift: RiftId,
        /// Why.
        cause: RiftCloseCause,
    },

    /// A dimension changed phase.
    DimensionStateChanged {
        /// Dimension.
        dimension: DimensionId,
        /// Previous state.
        from: DimensionState,
        /// New state.
        to: DimensionState,
        /// Stability at the time of the change.
        stability: f32,
    },

    /// An entity moved between dimensions.
    EntityMigrated {
        /// Entity.
        entity: EntityId,
        /// Dimension it left.
        from: DimensionId,
        /// Dimension it joined.
        to: DimensionId,
    },

    /// A matchmaking ticket was admitted.
    MatchmakingAdmitted {
        /// Ticket.
        ticket: TicketId,
        /// Session.
        session: SessionId,
        /// Dimension the party joined.
        dimension: DimensionId,
        /// Spawned entities.
        entities: Vec<EntityId>,
    },

    /// A matchmaking ticket expired.
    MatchmakingTimedOut {
        /// Ticket.
        ticket: TicketId,
        /// Session.
        session: SessionId,
        /// Ticks it waited.
        waited_ticks: u64,
    },
}

/// An event with the tick it happened in.
#[derive(Clone, Debug, PartialEq)]
pub struct TickEvent {
    /// Simulation tick.
    pub tick: Tick,
    /// The event.
    pub event: SimEvent,
}

/// Event channel for cross-thread communication.
///
/// Uses crossbeam for lock-free communication.
pub struct EventChannel<T> {
    sender: crossbeam_channel::Sender<T>,
    receiver: crossbeam_channel::Receiver<T>,
}

impl<T> EventChannel<T> {
    /// Creates a new bounded event channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self { sender, receiver }
    }

    /// Tries to send an event (returns immediately).
    ///
    /// # Errors
    ///
    /// Returns the event back if the channel is full.
    pub fn try_send(&self, event: T) -> Result<(), crossbeam_channel::TrySendError<T>> {
        self.sender.try_send(event)
    }

    /// Tries to receive an event (non-blocking).
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is empty.
    pub fn try_recv(&self) -> Result<T, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Gets a clone of the receiver for another thread.
    #[must_use]
    pub fn receiver(&self) -> crossbeam_channel::Receiver<T> {
        self.receiver.clone()
    }
}
