//! # Submit Handle
//!
//! The thread-safe front door of the simulation. Any thread may submit
//! invocations and matchmaking requests; the simulation drains them at the
//! start of its next tick.
//!
//! ## Cancellation
//!
//! An invocation can be cancelled until the drain of the tick that would run
//! it begins. Submitting and draining both hold the ledger lock, so a cancel
//! either lands before the drain or reports `false`.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::combat::AbilityInvocation;
use crate::dimension::DimensionKind;
use crate::error::SubmitClosed;
use crate::ids::{AbilityId, DimensionId, EntityId, InvocationId, SessionId, Tick, TicketId};
use crate::matchmaking::MatchmakingRequest;

/// Session traffic for the matchmaking queue.
#[derive(Clone, Debug)]
pub(crate) enum SessionRequest {
    Join(MatchmakingRequest),
    Leave(TicketId),
}

#[derive(Debug, Default)]
struct Ledger {
    pending: HashSet<InvocationId>,
    cancelled: HashSet<InvocationId>,
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct SubmitHandle {
    invocations: Sender<AbilityInvocation>,
    sessions: Sender<SessionRequest>,
    ledger: Arc<Mutex<Ledger>>,
    next_invocation: Arc<AtomicU64>,
    next_ticket: Arc<AtomicU64>,
    tick: Arc<AtomicU64>,
}

/// Simulation side of the handle.
pub(crate) struct Inbox {
    invocations: Receiver<AbilityInvocation>,
    sessions: Receiver<SessionRequest>,
    ledger: Arc<Mutex<Ledger>>,
    tick: Arc<AtomicU64>,
}

/// Creates a connected handle and inbox.
pub(crate) fn channel() -> (SubmitHandle, Inbox) {
    let (invocation_tx, invocation_rx) = crossbeam_channel::unbounded();
    let (session_tx, session_rx) = crossbeam_channel::unbounded();
    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let tick = Arc::new(AtomicU64::new(0));

    let handle = SubmitHandle {
        invocations: invocation_tx,
        sessions: session_tx,
        ledger: Arc::clone(&ledger),
        next_invocation: Arc::new(AtomicU64::new(1)),
        next_ticket: Arc::new(AtomicU64::new(1)),
        tick: Arc::clone(&tick),
    };
    let inbox = Inbox { invocations: invocation_rx, sessions: session_rx, ledger, tick };
    (handle, inbox)
}

impl SubmitHandle {
    /// Queues an ability invocation for the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitClosed`] if the simulation has been dropped.
    pub fn invoke(
        &self,
        caster: EntityId,
        ability: AbilityId,
        targets: Vec<EntityId>,
        dimension: DimensionId,
    ) -> Result<InvocationId, SubmitClosed> {
        let id = InvocationId(self.next_invocation.fetch_add(1, Ordering::Relaxed));
        let invocation = AbilityInvocation {
            id,
            caster,
            ability,
            targets,
            dimension,
            tick_submitted: self.current_tick(),
        };

        let mut ledger = self.ledger.lock();
        ledger.pending.insert(id);
        if self.invocations.send(invocation).is_err() {
            ledger.pending.remove(&id);
            return Err(SubmitClosed);
        }
        Ok(id)
    }

    /// Cancels a queued invocation.
    ///
    /// Returns false once its tick has begun (or the id is unknown).
    pub fn cancel(&self, id: InvocationId) -> bool {
        let mut ledger = self.ledger.lock();
        if ledger.pending.remove(&id) {
            ledger.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Asks matchmaking to place a party.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitClosed`] if the simulation has been dropped.
    pub fn request_match(
        &self,
        session: SessionId,
        party_size: usize,
        preferred: Option<DimensionKind>,
    ) -> Result<TicketId, SubmitClosed> {
        let ticket = TicketId(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let request = MatchmakingRequest { ticket, session, party_size, preferred };
        self.sessions.send(SessionRequest::Join(request)).map_err(|_| SubmitClosed)?;
        Ok(ticket)
    }

    /// Withdraws a matchmaking ticket if it is still queued.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitClosed`] if the simulation has been dropped.
    pub fn cancel_match(&self, ticket: TicketId) -> Result<(), SubmitClosed> {
        self.sessions.send(SessionRequest::Leave(ticket)).map_err(|_| SubmitClosed)
    }

    /// Last tick the simulation started.
    #[inline]
    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::Acquire)
    }
}

/// Invocations taken at the start of a tick.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub(crate) invocations: Vec<AbilityInvocation>,
    pub(crate) cancelled: usize,
}

impl Inbox {
    /// Publishes the tick number seen by handles.
    pub(crate) fn begin_tick(&self, tick: Tick) {
        self.tick.store(tick, Ordering::Release);
    }

    /// Takes every queued invocation, in arrival order, minus cancelled ones.
    pub(crate) fn drain_invocations(&self) -> Drained {
        let mut ledger = self.ledger.lock();
        let mut drained = Drained::default();
        for invocation in self.invocations.try_iter() {
            if ledger.cancelled.remove(&invocation.id) {
                drained.cancelled += 1;
                continue;
            }
            ledger.pending.remove(&invocation.id);
            drained.invocations.push(invocation);
        }
        drained
    }

    /// Takes every queued session request, in arrival order.
    pub(crate) fn drain_sessions(&self) -> Vec<SessionRequest> {
        self.sessions.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;

    fn dimension() -> DimensionId {
        DimensionId(ArenaKey { index: 0, generation: 0 })
    }

    #[test]
    fn test_cancel_before_drain() {
        let (handle, inbox) = channel();
        let kept = handle.invoke(EntityId(1), AbilityId(1), Vec::new(), dimension()).unwrap();
        let dropped = handle.invoke(EntityId(1), AbilityId(2), Vec::new(), dimension()).unwrap();
        assert!(handle.cancel(dropped));

        let drained = inbox.drain_invocations();
        assert_eq!(drained.cancelled, 1);
        assert_eq!(drained.invocations.iter().map(|i| i.id).collect::<Vec<_>>(), vec![kept]);
    }

    #[test]
    fn test_cancel_after_drain_is_refused() {
        let (handle, inbox) = channel();
        let id = handle.invoke(EntityId(1), AbilityId(1), Vec::new(), dimension()).unwrap();
        assert_eq!(inbox.drain_invocations().invocations.len(), 1);
        assert!(!handle.cancel(id));
    }

    #[test]
    fn test_closed_simulation() {
        let (handle, inbox) = channel();
        drop(inbox);
        assert_eq!(handle.invoke(EntityId(1), AbilityId(1), Vec::new(), dimension()), Err(SubmitClosed));
        assert_eq!(handle.request_match(SessionId(1), 2, None), Err(SubmitClosed));
    }

    #[test]
    fn test_handles_share_counters() {
        let (handle, inbox) = channel();
        let other = handle.clone();
        let a = handle.invoke(EntityId(1), AbilityId(1), Vec::new(), dimension()).unwrap();
        let b = other.invoke(EntityId(2), AbilityId(1), Vec::new(), dimension()).unwrap();
        assert_ne!(a, b);
        inbox.begin_tick(9);
        assert_eq!(other.current_tick(), 9);
    }
}
