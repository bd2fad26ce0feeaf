//! # Matchmaking Queue
//!
//! Sessions ask to join with a party. Tickets are scanned in arrival order
//! each tick; a ticket is admitted as soon as a dimension can take the
//! whole party, and times out otherwise.

use std::collections::VecDeque;

use crate::catalog::StatTable;
use crate::dimension::DimensionKind;
use crate::error::{Rejection, RejectionResult};
use crate::events::SimEvent;
use crate::ids::{DimensionId, EntityId, SessionId, Tick, TicketId};
use crate::manager::DimensionManager;

/// A join request from a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchmakingRequest {
    /// Ticket id, assigned at submission.
    pub ticket: TicketId,
    /// Requesting session.
    pub session: SessionId,
    /// Entities to spawn.
    pub party_size: usize,
    /// Preferred dimension kind, if any.
    pub preferred: Option<DimensionKind>,
}

/// A queued request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchmakingTicket {
    /// Ticket id.
    pub ticket: TicketId,
    /// Requesting session.
    pub session: SessionId,
    /// Entities to spawn.
    pub party_size: usize,
    /// Required dimension kind.
    pub affinity: Option<DimensionKind>,
    /// Tick the ticket was queued.
    pub queued_tick: Tick,
    /// First tick at which the ticket has timed out.
    pub expires_tick: Tick,
}

/// What happened to a ticket this tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchmakingOutcome {
    /// The party was spawned.
    Admitted {
        /// Ticket id.
        ticket: TicketId,
        /// Session.
        session: SessionId,
        /// Dimension joined.
        dimension: DimensionId,
        /// Spawned entities.
        entities: Vec<EntityId>,
    },
    /// The request was refused on arrival.
    Refused {
        /// Ticket id.
        ticket: TicketId,
        /// Session.
        session: SessionId,
        /// Why.
        rejection: Rejection,
    },
    /// The ticket waited too long.
    TimedOut {
        /// Ticket id.
        ticket: TicketId,
        /// Session.
        session: SessionId,
        /// Always [`Rejection::MatchmakingTimedOut`].
        rejection: Rejection,
    },
}

/// FIFO admission queue.
#[derive(Debug)]
pub struct MatchmakingQueue {
    tickets: VecDeque<MatchmakingTicket>,
    timeout_ticks: u64,
}

impl MatchmakingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(timeout_ticks: u64) -> Self {
        Self { tickets: VecDeque::new(), timeout_ticks }
    }

    /// Queued tickets.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Returns true when nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Queues a request.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidTarget`] for an empty party.
    pub fn enqueue(&mut self, request: MatchmakingRequest, tick: Tick) -> RejectionResult<()> {
        if request.party_size == 0 {
            return Err(Rejection::InvalidTarget { target: None, reason: "party is empty" });
        }
        tracing::debug!(
            ticket = request.ticket.0,
            session = request.session.0,
            party = request.party_size,
            "matchmaking ticket queued"
        );
        self.tickets.push_back(MatchmakingTicket {
            ticket: request.ticket,
            session: request.session,
            party_size: request.party_size,
            affinity: request.preferred,
            queued_tick: tick,
            expires_tick: tick.saturating_add(self.timeout_ticks),
        });
        Ok(())
    }

    /// Drops a queued ticket. Returns false if it was not queued.
    pub fn cancel(&mut self, ticket: TicketId) -> bool {
        let before = self.tickets.len();
        self.tickets.retain(|t| t.ticket != ticket);
        before != self.tickets.len()
    }

    /// Admits or expires tickets, oldest first.
    pub fn process(
        &mut self,
        manager: &mut DimensionManager,
        stats: &StatTable,
        tick: Tick,
        events: &mut Vec<SimEvent>,
    ) -> Vec<MatchmakingOutcome> {
        let mut outcomes = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.tickets.len());

        while let Some(ticket) = self.tickets.pop_front() {
            if tick >= ticket.expires_tick {
                let waited_ticks = tick - ticket.queued_tick;
                tracing::warn!(ticket = ticket.ticket.0, session = ticket.session.0, waited_ticks, "matchmaking timed out");
                events.push(SimEvent::MatchmakingTimedOut {
                    ticket: ticket.ticket,
                    session: ticket.session,
                    waited_ticks,
                });
                outcomes.push(MatchmakingOutcome::TimedOut {
                    ticket: ticket.ticket,
                    session: ticket.session,
                    rejection: Rejection::MatchmakingTimedOut { ticket: ticket.ticket, session: ticket.session },
                });
                continue;
            }

            match manager.admit_party(ticket.party_size, ticket.affinity, stats) {
                Ok((dimension, entities)) => {
                    tracing::info!(
                        ticket = ticket.ticket.0,
                        session = ticket.session.0,
                        %dimension,
                        party = entities.len(),
                        "matchmaking admitted"
                    );
                    events.push(SimEvent::MatchmakingAdmitted {
                        ticket: ticket.ticket,
                        session: ticket.session,
                        dimension,
                        entities: entities.clone(),
                    });
                    outcomes.push(MatchmakingOutcome::Admitted {
                        ticket: ticket.ticket,
                        session: ticket.session,
                        dimension,
                        entities,
                    });
                }
                Err(reason) => {
                    tracing::trace!(ticket = ticket.ticket.0, %reason, "matchmaking ticket waiting");
                    waiting.push_back(ticket);
                }
            }
        }

        self.tickets = waiting;
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DimensionLimits;

    fn request(ticket: u64, party_size: usize, preferred: Option<DimensionKind>) -> MatchmakingRequest {
        MatchmakingRequest { ticket: TicketId(ticket), session: SessionId(ticket * 10), party_size, preferred }
    }

    fn manager(max: usize, capacity: usize) -> DimensionManager {
        let limits = DimensionLimits { max_concurrent: max, entity_capacity: capacity, ..DimensionLimits::default() };
        DimensionManager::new(&limits, 3)
    }

    #[test]
    fn test_admits_in_arrival_order() {
        let stats = StatTable::default();
        let mut manager = manager(2, 4);
        let mut queue = MatchmakingQueue::new(10);
        queue.enqueue(request(1, 3, None), 0).unwrap();
        queue.enqueue(request(2, 2, None), 0).unwrap();
        queue.enqueue(request(3, 1, None), 0).unwrap();

        let outcomes = queue.process(&mut manager, &stats, 1, &mut Vec::new());
        let admitted: Vec<TicketId> = outcomes
            .iter()
            .filter_map(|o| match o {
                MatchmakingOutcome::Admitted { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .collect();

        // One regular dimension fits under the cap: 3 then 1 fill it, 2 waits.
        assert_eq!(admitted, vec![TicketId(1), TicketId(3)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_times_out_when_nothing_fits() {
        let stats = StatTable::default();
        let mut manager = manager(2, 8);
        manager.admit_party(4, None, &stats).unwrap();

        let mut queue = MatchmakingQueue::new(5);
        queue.enqueue(request(7, 5, None), 10).unwrap();
        let mut events = Vec::new();

        for tick in 11..15 {
            assert!(queue.process(&mut manager, &stats, tick, &mut events).is_empty());
        }
        let outcomes = queue.process(&mut manager, &stats, 15, &mut events);
        assert_eq!(
            outcomes,
            vec![MatchmakingOutcome::TimedOut {
                ticket: TicketId(7),
                session: SessionId(70),
                rejection: Rejection::MatchmakingTimedOut { ticket: TicketId(7), session: SessionId(70) },
            }]
        );
        assert_eq!(
            events,
            vec![SimEvent::MatchmakingTimedOut { ticket: TicketId(7), session: SessionId(70), waited_ticks: 5 }]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_and_empty_party() {
        let mut queue = MatchmakingQueue::new(5);
        queue.enqueue(request(1, 2, Some(DimensionKind::Void)), 0).unwrap();
        assert!(queue.enqueue(request(2, 0, None), 0).is_err());
        assert!(queue.cancel(TicketId(1)));
        assert!(!queue.cancel(TicketId(1)));
        assert!(queue.is_empty());
    }
}
