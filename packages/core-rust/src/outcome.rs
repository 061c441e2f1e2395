//! Terminal outcomes and subscription kinds.
//!
//! An operation ends in exactly one [`Outcome`]. The front declares how much of
//! the back's output it wants to see with a [`SubscriptionKind`], which travels
//! to the back on the first ticket.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ticket::TicketKind;

/// The single terminal classification of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Both sides finished their data flow normally.
    Completed,
    /// Customer code on either side cancelled the operation.
    Cancelled,
    /// The deadline elapsed.
    Expired,
    /// A ticket arrived that violated the protocol, or the back had no such method.
    ReceptionFailure,
    /// The send callback reported a failure.
    TransmissionFailure,
    /// Customer code on the front failed.
    ServicedFailure,
    /// Customer code on the back failed.
    ServicerFailure,
}

impl Outcome {
    /// Every outcome, in declaration order.
    pub const ALL: [Outcome; 7] = [
        Outcome::Completed,
        Outcome::Cancelled,
        Outcome::Expired,
        Outcome::ReceptionFailure,
        Outcome::TransmissionFailure,
        Outcome::ServicedFailure,
        Outcome::ServicerFailure,
    ];

    /// Stable lowercase label, used for metrics and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Cancelled => "cancelled",
            Outcome::Expired => "expired",
            Outcome::ReceptionFailure => "reception_failure",
            Outcome::TransmissionFailure => "transmission_failure",
            Outcome::ServicedFailure => "serviced_failure",
            Outcome::ServicerFailure => "servicer_failure",
        }
    }

    /// Returns `true` for every outcome except [`Outcome::Completed`].
    #[must_use]
    pub const fn is_abort(self) -> bool {
        !matches!(self, Outcome::Completed)
    }

    /// The ticket kind that announces this outcome to the peer, if any.
    #[must_use]
    pub const fn ticket_kind(self) -> Option<TicketKind> {
        match self {
            Outcome::Completed => None,
            Outcome::Cancelled => Some(TicketKind::Cancellation),
            Outcome::Expired => Some(TicketKind::Expiration),
            Outcome::ReceptionFailure => Some(TicketKind::ReceptionFailure),
            Outcome::TransmissionFailure => Some(TicketKind::TransmissionFailure),
            Outcome::ServicedFailure => Some(TicketKind::ServicedFailure),
            Outcome::ServicerFailure => Some(TicketKind::ServicerFailure),
        }
    }

    /// Position of this outcome in [`Outcome::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The front customer's declared interest in back-to-front tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionKind {
    /// Every payload the back emits, followed by completion.
    Full,
    /// Only the fact that the back completed.
    TerminationOnly,
    /// Nothing; the front is done once its own tickets are sent.
    None,
}

impl SubscriptionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SubscriptionKind::Full => "full",
            SubscriptionKind::TerminationOnly => "termination_only",
            SubscriptionKind::None => "none",
        }
    }
}
