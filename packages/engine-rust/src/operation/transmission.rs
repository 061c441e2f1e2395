//! Transmission: outgoing tickets, one send at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ticketline_core::{OperationId, Outcome, Payload, SubscriptionKind, Ticket, TicketKind};
use tracing::{trace, warn};
use uuid::Uuid;

use super::{Operation, OperationState};

/// How much of the local emission reaches the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Payloads,
    TerminationOnly,
    Nothing,
}

impl From<SubscriptionKind> for Delivery {
    fn from(kind: SubscriptionKind) -> Self {
        match kind {
            SubscriptionKind::Full => Delivery::Payloads,
            SubscriptionKind::TerminationOnly => Delivery::TerminationOnly,
            SubscriptionKind::None => Delivery::Nothing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortState {
    Active,
    Pending(TicketKind),
    Finished,
}

/// Fields carried only by the front's first ticket.
struct Lead {
    name: String,
    subscription: SubscriptionKind,
    trace_id: Option<Uuid>,
}

/// What the transmission manager wants done next.
pub(super) enum Step {
    Send(Ticket),
    /// Emission finished and nothing is delivered to the peer.
    CompleteLocally,
    /// No sequence number is left for the next data ticket.
    Exhausted,
    Idle,
}

#[allow(clippy::struct_excessive_bools)]
pub(super) struct TransmissionManager {
    delivery: Delivery,
    lead: Option<Lead>,
    next_sequence_number: u64,
    queue: VecDeque<Payload>,
    emission_complete: bool,
    completion_sent: bool,
    pending_timeout: Option<Duration>,
    abort: AbortState,
    in_flight: bool,
    renegotiates: bool,
}

impl TransmissionManager {
    pub(super) fn front(
        name: String,
        subscription: SubscriptionKind,
        trace_id: Option<Uuid>,
    ) -> Self {
        Self {
            lead: Some(Lead {
                name,
                subscription,
                trace_id,
            }),
            renegotiates: true,
            ..Self::back()
        }
    }

    pub(super) fn back() -> Self {
        Self {
            delivery: Delivery::Payloads,
            lead: None,
            next_sequence_number: 0,
            queue: VecDeque::new(),
            emission_complete: false,
            completion_sent: false,
            pending_timeout: None,
            abort: AbortState::Active,
            in_flight: false,
            renegotiates: false,
        }
    }

    /// Applies the front's subscription to the back's output.
    pub(super) fn set_delivery(&mut self, subscription: SubscriptionKind) {
        self.delivery = subscription.into();
    }

    pub(super) fn is_emission_complete(&self) -> bool {
        self.emission_complete
    }

    /// Queues a payload and/or the end of emission.
    pub(super) fn emit(&mut self, payload: Option<Payload>, complete: bool) {
        if self.emission_complete || self.abort != AbortState::Active {
            return;
        }
        if let Some(payload) = payload {
            if self.delivery == Delivery::Payloads {
                self.queue.push_back(payload);
            }
        }
        self.emission_complete = complete;
    }

    /// Schedules `timeout` to ride on the next outgoing ticket. Only the
    /// front tells its peer about deadlines.
    pub(super) fn renegotiate(&mut self, timeout: Duration) {
        if self.renegotiates && !self.completion_sent && self.abort == AbortState::Active {
            self.pending_timeout = Some(timeout);
        }
    }

    /// Discards queued output. `kind` is the abort ticket to send, if any;
    /// a front that has not begun sending stays silent.
    pub(super) fn abort(&mut self, kind: Option<TicketKind>) {
        self.queue.clear();
        self.pending_timeout = None;
        if self.abort != AbortState::Active {
            return;
        }
        self.abort = match kind {
            Some(kind) if self.lead.is_none() => AbortState::Pending(kind),
            _ => AbortState::Finished,
        };
    }

    /// No send is in flight and none is owed.
    pub(super) fn is_idle(&self) -> bool {
        !self.in_flight && !matches!(self.abort, AbortState::Pending(_))
    }

    fn sent(&mut self) {
        self.in_flight = false;
    }

    pub(super) fn next_step(&mut self, operation_id: OperationId) -> Step {
        if self.in_flight {
            return Step::Idle;
        }
        match self.abort {
            AbortState::Finished => return Step::Idle,
            AbortState::Pending(kind) => {
                self.abort = AbortState::Finished;
                return match self.stamp(Ticket::new(operation_id, 0, kind)) {
                    Some(ticket) => Step::Send(ticket),
                    None => Step::Idle,
                };
            }
            AbortState::Active => {}
        }
        if self.completion_sent {
            return Step::Idle;
        }
        if self.delivery == Delivery::Nothing {
            if self.emission_complete {
                self.completion_sent = true;
                return Step::CompleteLocally;
            }
            return Step::Idle;
        }

        let payload = self.queue.pop_front();
        let last = self.emission_complete && self.queue.is_empty();
        if payload.is_none() && !last && self.pending_timeout.is_none() && self.lead.is_none() {
            return Step::Idle;
        }

        let lead = self.lead.take();
        let kind = match (lead.is_some(), last) {
            (true, true) => TicketKind::Entire,
            (true, false) => TicketKind::Commencement,
            (false, true) => TicketKind::Completion,
            (false, false) => TicketKind::Continuation,
        };
        let mut ticket = Ticket::new(operation_id, 0, kind);
        ticket.payload = payload;
        ticket.timeout = self.pending_timeout.take();
        if let Some(lead) = lead {
            ticket.name = Some(lead.name);
            ticket.subscription = Some(lead.subscription);
            ticket.trace_id = lead.trace_id;
        }
        match self.stamp(ticket) {
            Some(ticket) => {
                self.completion_sent = last;
                Step::Send(ticket)
            }
            None => Step::Exhausted,
        }
    }

    /// Assigns the next sequence number and marks the send in flight.
    /// `u64::MAX` is never assigned; the peer rejects it.
    fn stamp(&mut self, mut ticket: Ticket) -> Option<Ticket> {
        let successor = self.next_sequence_number.checked_add(1)?;
        ticket.sequence_number = self.next_sequence_number;
        self.next_sequence_number = successor;
        self.in_flight = true;
        Some(ticket)
    }
}

impl Operation {
    /// Starts a send task if the transmission manager has work.
    pub(super) fn pump_transmission_locked(self: &Arc<Self>, st: &mut OperationState) {
        match st.transmission.next_step(self.id) {
            Step::Send(ticket) => {
                let operation = Arc::clone(self);
                self.pool.spawn("transmission", operation.send_loop(ticket));
            }
            Step::CompleteLocally => self.complete_transmission_locked(st),
            Step::Exhausted => self.exhausted_locked(st),
            Step::Idle => {}
        }
    }

    fn exhausted_locked(self: &Arc<Self>, st: &mut OperationState) {
        warn!(operation_id = %self.id, side = self.side.as_str(), "sequence numbers exhausted");
        self.abort_locked(st, Outcome::TransmissionFailure, false);
    }

    async fn send_loop(self: Arc<Self>, mut ticket: Ticket) -> anyhow::Result<()> {
        loop {
            let kind = ticket.kind;
            let sequence_number = ticket.sequence_number;
            trace!(
                operation_id = %self.id,
                side = self.side.as_str(),
                ?kind,
                sequence_number,
                "sending ticket"
            );
            let result = self.link.send(ticket).await;
            let next = {
                let mut st = self.state.lock();
                self.after_send_locked(&mut st, kind, result)
            };
            match next {
                Some(next) => ticket = next,
                None => return Ok(()),
            }
        }
    }

    /// Applies a send result and returns the next ticket to send, if any.
    fn after_send_locked(
        self: &Arc<Self>,
        st: &mut OperationState,
        kind: TicketKind,
        result: anyhow::Result<()>,
    ) -> Option<Ticket> {
        st.transmission.sent();
        match result {
            Err(err) if kind.is_abort() => {
                warn!(operation_id = %self.id, ?kind, error = %err, "failed to send abort ticket");
            }
            Err(err) => {
                warn!(operation_id = %self.id, ?kind, error = %err, "ticket send failed");
                self.abort_locked(st, Outcome::TransmissionFailure, false);
            }
            Ok(()) if kind.is_final() => self.complete_transmission_locked(st),
            Ok(()) => {}
        }
        let next = match st.transmission.next_step(self.id) {
            Step::Send(ticket) => Some(ticket),
            Step::CompleteLocally => {
                self.complete_transmission_locked(st);
                None
            }
            Step::Exhausted => {
                self.exhausted_locked(st);
                None
            }
            Step::Idle => None,
        };
        self.finish_if_settled(st);
        next
    }
}
