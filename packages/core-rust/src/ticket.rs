//! The ticket: the unit exchanged between the front and back of an operation.
//!
//! Tickets are transport-independent. A transport carries them however it
//! likes; the engine only cares about the operation id, the per-direction
//! sequence number, and the [`TicketKind`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outcome::{Outcome, SubscriptionKind};

/// Opaque customer value carried by a ticket.
pub type Payload = Bytes;

/// Identifies one in-flight operation on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Allocates a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of ticket kinds.
///
/// Data kinds trace the path `COMMENCEMENT → CONTINUATION* → COMPLETION`, or
/// the single-ticket shortcut `ENTIRE`. Only the front ever leads. The
/// remaining kinds each announce an abort and map onto an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketKind {
    Commencement,
    Continuation,
    Completion,
    Entire,
    Cancellation,
    Expiration,
    ServicedFailure,
    ServicerFailure,
    ReceptionFailure,
    TransmissionFailure,
}

impl TicketKind {
    /// First ticket of a front-to-back stream.
    #[must_use]
    pub const fn is_leading(self) -> bool {
        matches!(self, TicketKind::Commencement | TicketKind::Entire)
    }

    /// Last data ticket of a stream.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, TicketKind::Completion | TicketKind::Entire)
    }

    /// The outcome announced by an abort kind; `None` for data kinds.
    #[must_use]
    pub const fn abort_outcome(self) -> Option<Outcome> {
        match self {
            TicketKind::Commencement
            | TicketKind::Continuation
            | TicketKind::Completion
            | TicketKind::Entire => None,
            TicketKind::Cancellation => Some(Outcome::Cancelled),
            TicketKind::Expiration => Some(Outcome::Expired),
            TicketKind::ServicedFailure => Some(Outcome::ServicedFailure),
            TicketKind::ServicerFailure => Some(Outcome::ServicerFailure),
            TicketKind::ReceptionFailure => Some(Outcome::ReceptionFailure),
            TicketKind::TransmissionFailure => Some(Outcome::TransmissionFailure),
        }
    }

    #[must_use]
    pub const fn is_abort(self) -> bool {
        self.abort_outcome().is_some()
    }
}

/// A single message of one operation, in one direction.
///
/// `name`, `subscription` and `trace_id` appear only on the front's first
/// ticket. `timeout` appears on front tickets that (re)establish a deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub operation_id: OperationId,
    pub sequence_number: u64,
    pub kind: TicketKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Ticket {
    /// Creates a ticket with no optional fields set.
    #[must_use]
    pub fn new(operation_id: OperationId, sequence_number: u64, kind: TicketKind) -> Self {
        Self {
            operation_id,
            sequence_number,
            kind,
            name: None,
            subscription: None,
            trace_id: None,
            payload: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_subscription(mut self, subscription: SubscriptionKind) -> Self {
        self.subscription = Some(subscription);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
