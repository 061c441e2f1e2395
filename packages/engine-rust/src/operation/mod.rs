//! Per-operation lifecycle state machine.
//!
//! An [`Operation`] is one call as seen from one side. Its five managers
//! (termination, expiration, transmission, ingestion, reception) live by value
//! in a single [`OperationState`] behind one `parking_lot::Mutex`. A manager
//! that needs another manager simply calls it on the locked state; the
//! orchestration lives in `impl Operation` blocks next to each manager.
//!
//! The lock is never held across an `.await`, a call into customer code, or a
//! link send. Those always run on the [`WorkPool`], which re-enters the lock
//! afterwards to apply the result.

mod context;
mod expiration;
mod ingestion;
mod reception;
mod termination;
mod transmission;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ticketline_core::{OperationId, Outcome, Payload, SubscriptionKind, TicketKind};
use tracing::info;
use uuid::Uuid;

use crate::pool::WorkPool;
use crate::traits::{Consumer, Servicer, TicketSink};

pub use context::{Emitter, OperationContext, OperationHandle};
pub(crate) use termination::TerminationCallback;

use expiration::ExpirationManager;
use ingestion::IngestionManager;
use reception::ReceptionManager;
use termination::TerminationManager;
use transmission::TransmissionManager;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Which end of the call an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The invoking side.
    Front,
    /// The servicing side.
    Back,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Side::Front => "front",
            Side::Back => "back",
        }
    }

    /// Outcome recorded when customer code on this side fails.
    #[must_use]
    pub const fn local_failure(self) -> Outcome {
        match self {
            Side::Front => Outcome::ServicedFailure,
            Side::Back => Outcome::ServicerFailure,
        }
    }

    /// Ticket kind announcing a locally detected `outcome` to the peer.
    ///
    /// `None` when the outcome is not something this side tells the peer:
    /// completion travels as data, a transmission failure means the link is
    /// unusable, and neither side reports the other side's customer failure.
    pub(crate) const fn announced_kind(self, outcome: Outcome) -> Option<TicketKind> {
        match (self, outcome) {
            (_, Outcome::Completed | Outcome::TransmissionFailure)
            | (Side::Front, Outcome::ServicerFailure)
            | (Side::Back, Outcome::ServicedFailure) => None,
            (_, outcome) => outcome.ticket_kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// What the front customer wants to hear back from the back.
pub enum Subscription {
    /// Feed every payload, then termination, into this consumer.
    Full(Box<dyn Consumer>),
    /// Only track termination (see [`OperationContext::add_termination_callback`]).
    TerminationOnly,
    /// Nothing; the operation completes once the front's tickets are sent.
    None,
}

impl Subscription {
    #[must_use]
    pub fn full(consumer: impl Consumer) -> Self {
        Subscription::Full(Box::new(consumer))
    }

    #[must_use]
    pub fn kind(&self) -> SubscriptionKind {
        match self {
            Subscription::Full(_) => SubscriptionKind::Full,
            Subscription::TerminationOnly => SubscriptionKind::TerminationOnly,
            Subscription::None => SubscriptionKind::None,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// All mutable state of one operation, guarded by `Operation::state`.
pub(crate) struct OperationState {
    termination: TerminationManager,
    expiration: ExpirationManager,
    transmission: TransmissionManager,
    ingestion: IngestionManager,
    reception: ReceptionManager,
    trace_id: Option<Uuid>,
}

/// Parameters of a front operation, taken from `FrontEnd::operate`.
pub(crate) struct FrontRequest {
    pub(crate) name: String,
    pub(crate) subscription: Subscription,
    pub(crate) trace_id: Option<Uuid>,
}

pub(crate) struct Operation {
    id: OperationId,
    side: Side,
    pool: WorkPool,
    link: Arc<dyn TicketSink>,
    servicer: Option<Arc<dyn Servicer>>,
    maximum_timeout: Duration,
    state: Mutex<OperationState>,
}

impl Operation {
    /// Assembles a front operation. Nothing is sent until [`Operation::commence`].
    pub(crate) fn front(
        id: OperationId,
        request: FrontRequest,
        pool: WorkPool,
        link: Arc<dyn TicketSink>,
        maximum_timeout: Duration,
        on_terminate: TerminationCallback,
    ) -> Arc<Self> {
        let kind = request.subscription.kind();
        let consumer = match request.subscription {
            Subscription::Full(consumer) => Some(consumer),
            Subscription::TerminationOnly | Subscription::None => None,
        };
        let state = OperationState {
            termination: TerminationManager::new(
                true,
                kind != SubscriptionKind::None,
                on_terminate,
            ),
            expiration: ExpirationManager::new(),
            transmission: TransmissionManager::front(request.name, kind, request.trace_id),
            ingestion: IngestionManager::front(consumer),
            reception: ReceptionManager::new(Side::Front),
            trace_id: request.trace_id,
        };
        Arc::new(Self {
            id,
            side: Side::Front,
            pool,
            link,
            servicer: None,
            maximum_timeout,
            state: Mutex::new(state),
        })
    }

    /// Assembles a back operation for a ticket with an unknown id. The
    /// servicer is started when the leading ticket is dispatched.
    pub(crate) fn back(
        id: OperationId,
        servicer: Arc<dyn Servicer>,
        pool: WorkPool,
        link: Arc<dyn TicketSink>,
        maximum_timeout: Duration,
        on_terminate: TerminationCallback,
    ) -> Arc<Self> {
        let state = OperationState {
            termination: TerminationManager::new(true, true, on_terminate),
            expiration: ExpirationManager::new(),
            transmission: TransmissionManager::back(),
            ingestion: IngestionManager::back(),
            reception: ReceptionManager::new(Side::Back),
            trace_id: None,
        };
        Arc::new(Self {
            id,
            side: Side::Back,
            pool,
            link,
            servicer: Some(servicer),
            maximum_timeout,
            state: Mutex::new(state),
        })
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    /// Arms the deadline and queues the front's first ticket. The caller
    /// clamps `timeout`.
    pub(crate) fn commence(
        self: &Arc<Self>,
        payload: Option<Payload>,
        complete: bool,
        timeout: Duration,
    ) {
        let mut st = self.state.lock();
        self.change_timeout_locked(&mut st, timeout);
        st.transmission.renegotiate(timeout);
        st.transmission.emit(payload, complete);
        self.pump_transmission_locked(&mut st);
    }

    /// Arms the default deadline of a freshly created back operation, unless
    /// its first ticket already set one.
    pub(crate) fn arm_default(self: &Arc<Self>, timeout: Duration) {
        let mut st = self.state.lock();
        if st.expiration.is_idle() && st.termination.is_active() {
            self.change_timeout_locked(&mut st, timeout);
        }
    }

    /// Aborts from outside the lock, announcing the outcome to the peer when
    /// this side is the one that should.
    pub(crate) fn abort(self: &Arc<Self>, outcome: Outcome) {
        let mut st = self.state.lock();
        self.abort_locked(&mut st, outcome, true);
    }

    /// Broadcasts an abort to every manager. Only the first terminal outcome
    /// of an operation has any effect.
    ///
    /// `announce` is `false` when the abort was itself caused by the peer (an
    /// abort ticket) or by the link (a failed send).
    fn abort_locked(self: &Arc<Self>, st: &mut OperationState, outcome: Outcome, announce: bool) {
        let Some(callbacks) = st.termination.abort(outcome) else {
            return;
        };
        info!(
            operation_id = %self.id,
            side = self.side.as_str(),
            outcome = %outcome,
            announce,
            "operation aborted"
        );
        let kind = if announce { self.side.announced_kind(outcome) } else { None };
        st.transmission.abort(kind);
        if let Some(consumer) = st.ingestion.abort() {
            self.retire_consumer(consumer);
        }
        st.expiration.abort();
        st.reception.abort();
        self.notify_terminated(outcome, callbacks);
        self.pump_transmission_locked(st);
        self.finish_if_settled(st);
    }

    /// Shared tail of both completion paths.
    fn on_completed_locked(&self, st: &mut OperationState, callbacks: Vec<TerminationCallback>) {
        info!(
            operation_id = %self.id,
            side = self.side.as_str(),
            "operation completed"
        );
        st.expiration.abort();
        st.reception.abort();
        self.notify_terminated(Outcome::Completed, callbacks);
        self.finish_if_settled(st);
    }

    fn complete_ingestion_locked(&self, st: &mut OperationState) {
        if let Some(callbacks) = st.termination.ingestion_complete() {
            self.on_completed_locked(st, callbacks);
        }
    }

    fn complete_transmission_locked(&self, st: &mut OperationState) {
        if let Some(callbacks) = st.termination.transmission_complete() {
            self.on_completed_locked(st, callbacks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_failure_depends_on_side() {
        assert_eq!(Side::Front.local_failure(), Outcome::ServicedFailure);
        assert_eq!(Side::Back.local_failure(), Outcome::ServicerFailure);
    }

    #[test]
    fn sides_never_announce_the_peers_failure() {
        assert_eq!(Side::Front.announced_kind(Outcome::ServicerFailure), None);
        assert_eq!(Side::Back.announced_kind(Outcome::ServicedFailure), None);
        assert_eq!(
            Side::Front.announced_kind(Outcome::ServicedFailure),
            Some(TicketKind::ServicedFailure)
        );
        assert_eq!(
            Side::Back.announced_kind(Outcome::ServicerFailure),
            Some(TicketKind::ServicerFailure)
        );
    }

    #[test]
    fn completion_and_link_failure_are_never_announced() {
        for side in [Side::Front, Side::Back] {
            assert_eq!(side.announced_kind(Outcome::Completed), None);
            assert_eq!(side.announced_kind(Outcome::TransmissionFailure), None);
            assert_eq!(
                side.announced_kind(Outcome::Cancelled),
                Some(TicketKind::Cancellation)
            );
            assert_eq!(
                side.announced_kind(Outcome::Expired),
                Some(TicketKind::Expiration)
            );
            assert_eq!(
                side.announced_kind(Outcome::ReceptionFailure),
                Some(TicketKind::ReceptionFailure)
            );
        }
    }

    #[test]
    fn subscription_kind_reflects_variant() {
        assert_eq!(Subscription::TerminationOnly.kind(), SubscriptionKind::TerminationOnly);
        assert_eq!(Subscription::None.kind(), SubscriptionKind::None);
    }
}
