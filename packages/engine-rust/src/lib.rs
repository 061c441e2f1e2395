//! Ticketline Engine: the lifecycle of bidirectional RPC operations.
//!
//! A [`FrontEnd`] turns customer payloads into ordered, cancellable,
//! deadline-bounded ticket streams; a [`BackEnd`] receives them and drives a
//! [`Servicer`]. Transport is supplied by the embedder through [`TicketSink`]
//! and [`TicketReceiver`].

pub mod config;
pub mod end;
pub mod error;
pub mod logging;
mod operation;
pub mod pool;
pub mod traits;

pub use config::EngineConfig;
pub use end::{BackEnd, FrontEnd, IdleAction};
pub use error::{ConsumerError, EngineError, ServicerError};
pub use logging::init_tracing;
pub use operation::{Emitter, OperationContext, OperationHandle, Side, Subscription};
pub use pool::WorkPool;
pub use traits::{Consumer, Servicer, TicketReceiver, TicketSink};

pub use ticketline_core::{OperationId, Outcome, Payload, SubscriptionKind, Ticket, TicketKind};
