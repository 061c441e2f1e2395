use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ticketline_core::{OperationId, Outcome, Payload, Ticket};
use tracing::{debug, info};
use uuid::Uuid;

use super::registry::{IdleAction, OperationRegistry};
use crate::config::EngineConfig;
use crate::operation::{FrontRequest, Operation, OperationHandle, Side, Subscription};
use crate::pool::WorkPool;
use crate::traits::{TicketReceiver, TicketSink};

/// The invoking end of a link.
pub struct FrontEnd {
    config: Arc<EngineConfig>,
    link: Arc<dyn TicketSink>,
    registry: Arc<OperationRegistry>,
}

impl FrontEnd {
    #[must_use]
    pub fn new(config: Arc<EngineConfig>, pool: WorkPool, link: Arc<dyn TicketSink>) -> Self {
        Self {
            config,
            link,
            registry: OperationRegistry::new(Side::Front, pool, Duration::ZERO),
        }
    }

    /// Starts an operation invoking method `name` on the back.
    ///
    /// `payload` and `complete` make up the first emission; further payloads
    /// go through the handle's [`Emitter`](crate::Emitter). `timeout`
    /// defaults to the configured default and is clamped to the maximum.
    pub fn operate(
        &self,
        name: impl Into<String>,
        payload: Option<Payload>,
        complete: bool,
        timeout: Option<Duration>,
        subscription: Subscription,
        trace_id: Option<Uuid>,
    ) -> OperationHandle {
        let id = OperationId::random();
        let name = name.into();
        info!(operation_id = %id, method = %name, ?subscription, "operation commencing");
        let request = FrontRequest {
            name,
            subscription,
            trace_id,
        };
        let operation = Operation::front(
            id,
            request,
            self.registry.pool().clone(),
            Arc::clone(&self.link),
            self.config.maximum_timeout,
            self.registry.removal_hook(id),
        );
        let handle = OperationHandle::new(&operation);
        self.registry.insert(Arc::clone(&operation));
        let timeout = self
            .config
            .clamp_timeout(timeout.unwrap_or(self.config.default_timeout));
        operation.commence(payload, complete, timeout);
        handle
    }

    /// Per-outcome counts of the operations this end has finished.
    #[must_use]
    pub fn operation_stats(&self) -> HashMap<Outcome, u64> {
        self.registry.stats()
    }

    /// Number of operations still registered.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs `action` on the pool once no operation is live.
    pub fn add_idle_action(&self, action: impl FnOnce() + Send + 'static) {
        self.registry.add_idle_action(Box::new(action) as IdleAction);
    }

    /// Resolves once no operation is live.
    pub async fn wait_idle(&self) {
        self.registry.wait_idle().await;
    }
}

impl TicketReceiver for FrontEnd {
    fn receive_ticket(&self, ticket: Ticket) {
        match self.registry.get(ticket.operation_id) {
            Some(operation) => operation.receive_ticket(ticket),
            None => debug!(
                operation_id = %ticket.operation_id,
                kind = ?ticket.kind,
                "ticket for unknown operation dropped"
            ),
        }
    }
}
