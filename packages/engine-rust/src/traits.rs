use async_trait::async_trait;
use ticketline_core::{Payload, Ticket};

use crate::error::{ConsumerError, ServicerError};
use crate::operation::{Emitter, OperationContext};

/// Outbound half of a transport link.
/// Implementations: sockets, channels, in-process relays (tests).
#[async_trait]
pub trait TicketSink: Send + Sync + 'static {
    /// Deliver one ticket to the peer. May block; always called from the
    /// worker pool, never more than once at a time per operation.
    async fn send(&self, ticket: Ticket) -> anyhow::Result<()>;
}

/// Inbound half of a transport link, implemented by both ends.
pub trait TicketReceiver: Send + Sync {
    /// Accept a ticket from the peer. Safe to call from any thread.
    fn receive_ticket(&self, ticket: Ticket);
}

/// Customer code that consumes the payloads of one operation, in order.
///
/// Each call runs on the worker pool and never overlaps with another call for
/// the same operation.
#[async_trait]
pub trait Consumer: Send + 'static {
    /// Accept the next payload.
    async fn consume(&mut self, payload: Payload) -> Result<(), ConsumerError>;

    /// No further payloads will arrive.
    async fn terminate(&mut self) -> Result<(), ConsumerError>;

    /// Accept the last payload. Default forwards to `consume` then `terminate`.
    async fn consume_and_terminate(&mut self, payload: Payload) -> Result<(), ConsumerError> {
        self.consume(payload).await?;
        self.terminate().await
    }
}

/// Back-side method dispatch.
#[async_trait]
pub trait Servicer: Send + Sync + 'static {
    /// Start method `name`, returning the consumer that will receive the
    /// front's payloads. Output goes through `emitter`.
    async fn service(
        &self,
        name: &str,
        context: OperationContext,
        emitter: Emitter,
    ) -> Result<Box<dyn Consumer>, ServicerError>;
}
