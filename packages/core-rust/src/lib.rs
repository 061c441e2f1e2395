//! Ticketline Core: tickets, outcomes, and subscription kinds shared by both
//! ends of an operation.

pub mod outcome;
pub mod ticket;

pub use outcome::{Outcome, SubscriptionKind};
pub use ticket::{OperationId, Payload, Ticket, TicketKind};
