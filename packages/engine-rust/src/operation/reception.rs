//! Reception: sequencing and dispatch of tickets from the peer.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use ticketline_core::{Outcome, SubscriptionKind, Ticket};
use tracing::{debug, trace, warn};

use super::ingestion::{Feed, Offer};
use super::{Operation, OperationState, Side};

/// What to do with a received ticket.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Verdict {
    Ignored,
    Violation(&'static str),
    Abort(Outcome),
    /// In-order tickets ready for dispatch, in sequence.
    Deliver(Vec<Ticket>),
    Buffered,
}

pub(super) struct ReceptionManager {
    side: Side,
    lowest_unseen_sequence_number: u64,
    completed_sequence_number: Option<u64>,
    buffer: BTreeMap<u64, Ticket>,
    aborted: bool,
}

impl ReceptionManager {
    pub(super) fn new(side: Side) -> Self {
        Self {
            side,
            lowest_unseen_sequence_number: 0,
            completed_sequence_number: None,
            buffer: BTreeMap::new(),
            aborted: false,
        }
    }

    pub(super) fn receive(&mut self, ticket: Ticket) -> Verdict {
        if self.aborted {
            return Verdict::Ignored;
        }
        let sequence_number = ticket.sequence_number;
        if sequence_number < self.lowest_unseen_sequence_number
            || self.buffer.contains_key(&sequence_number)
        {
            return Verdict::Violation("duplicate sequence number");
        }
        if let Some(outcome) = ticket.kind.abort_outcome() {
            return Verdict::Abort(outcome);
        }
        if self
            .completed_sequence_number
            .is_some_and(|completed| sequence_number >= completed)
        {
            return Verdict::Violation("data after completion");
        }
        if ticket.kind.is_leading() {
            if self.side == Side::Front || sequence_number != 0 {
                return Verdict::Violation("unexpected leading ticket");
            }
        } else if self.side == Side::Back && sequence_number == 0 {
            return Verdict::Violation("first ticket does not lead");
        }
        // No successor is ever sent after `u64::MAX`, so the peer cannot
        // have produced it.
        let Some(successor) = sequence_number.checked_add(1) else {
            return Verdict::Violation("sequence number out of range");
        };
        if ticket.kind.is_final() {
            let later = (Bound::Excluded(sequence_number), Bound::Unbounded);
            if self.buffer.range(later).next().is_some() {
                return Verdict::Violation("completion precedes buffered tickets");
            }
            self.completed_sequence_number = Some(sequence_number);
        }

        if sequence_number != self.lowest_unseen_sequence_number {
            self.buffer.insert(sequence_number, ticket);
            return Verdict::Buffered;
        }
        let mut ready = vec![ticket];
        self.lowest_unseen_sequence_number = successor;
        while let Some(next) = self.buffer.remove(&self.lowest_unseen_sequence_number) {
            // Buffered numbers are all below `u64::MAX`.
            let Some(successor) = next.sequence_number.checked_add(1) else {
                return Verdict::Violation("sequence number out of range");
            };
            ready.push(next);
            self.lowest_unseen_sequence_number = successor;
        }
        Verdict::Deliver(ready)
    }

    pub(super) fn abort(&mut self) {
        self.aborted = true;
        self.buffer.clear();
    }
}

impl Operation {
    /// Entry point for every ticket the peer sends for this operation.
    pub(crate) fn receive_ticket(self: &Arc<Self>, ticket: Ticket) {
        let mut st = self.state.lock();
        if !st.termination.is_active() {
            trace!(
                operation_id = %self.id,
                kind = ?ticket.kind,
                "ticket for terminated operation ignored"
            );
            return;
        }
        let kind = ticket.kind;
        let sequence_number = ticket.sequence_number;
        match st.reception.receive(ticket) {
            Verdict::Ignored => {}
            Verdict::Buffered => {
                trace!(operation_id = %self.id, ?kind, sequence_number, "ticket buffered");
            }
            Verdict::Violation(reason) => {
                warn!(
                    operation_id = %self.id,
                    side = self.side.as_str(),
                    ?kind,
                    sequence_number,
                    reason,
                    "protocol violation"
                );
                self.abort_locked(&mut st, Outcome::ReceptionFailure, true);
            }
            Verdict::Abort(outcome) => {
                debug!(operation_id = %self.id, ?kind, "peer aborted operation");
                self.abort_locked(&mut st, outcome, false);
            }
            Verdict::Deliver(tickets) => {
                for ticket in tickets {
                    if !st.termination.is_active() {
                        break;
                    }
                    self.dispatch_locked(&mut st, ticket);
                }
            }
        }
    }

    fn dispatch_locked(self: &Arc<Self>, st: &mut OperationState, ticket: Ticket) {
        trace!(
            operation_id = %self.id,
            kind = ?ticket.kind,
            sequence_number = ticket.sequence_number,
            "dispatching ticket"
        );
        if let Some(timeout) = ticket.timeout {
            self.change_timeout_locked(st, timeout.min(self.maximum_timeout));
        }
        if ticket.kind.is_leading() {
            st.trace_id = ticket.trace_id;
            st.transmission
                .set_delivery(ticket.subscription.unwrap_or(SubscriptionKind::Full));
            let Some(name) = ticket.name else {
                warn!(operation_id = %self.id, "leading ticket carries no method name");
                self.abort_locked(st, Outcome::ReceptionFailure, true);
                return;
            };
            st.ingestion.start(name);
        }

        let feed = match (ticket.payload, ticket.kind.is_final()) {
            (Some(payload), false) => Some(Feed::Consume(payload)),
            (Some(payload), true) => Some(Feed::ConsumeAndTerminate(payload)),
            (None, true) => Some(Feed::Terminate),
            (None, false) => None,
        };
        if let Some(feed) = feed {
            if st.ingestion.offer(feed) == Offer::Completed {
                self.complete_ingestion_locked(st);
            }
        }
        self.pump_ingestion_locked(st);
    }
}
