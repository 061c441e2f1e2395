use std::collections::HashMap;
use std::sync::Arc;

use ticketline_core::{Outcome, Ticket};
use tracing::debug;

use super::registry::{IdleAction, OperationRegistry};
use crate::config::EngineConfig;
use crate::operation::{Operation, Side};
use crate::pool::WorkPool;
use crate::traits::{Servicer, TicketReceiver, TicketSink};

/// The servicing end of a link. Operations are created by the first ticket
/// that arrives for an unknown id.
pub struct BackEnd {
    config: Arc<EngineConfig>,
    link: Arc<dyn TicketSink>,
    servicer: Arc<dyn Servicer>,
    registry: Arc<OperationRegistry>,
}

impl BackEnd {
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        pool: WorkPool,
        link: Arc<dyn TicketSink>,
        servicer: Arc<dyn Servicer>,
    ) -> Self {
        let registry = OperationRegistry::new(Side::Back, pool, config.maximum_timeout);
        Self {
            config,
            link,
            servicer,
            registry,
        }
    }

    #[must_use]
    pub fn operation_stats(&self) -> HashMap<Outcome, u64> {
        self.registry.stats()
    }

    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.registry.len()
    }

    pub fn add_idle_action(&self, action: impl FnOnce() + Send + 'static) {
        self.registry.add_idle_action(Box::new(action) as IdleAction);
    }

    pub async fn wait_idle(&self) {
        self.registry.wait_idle().await;
    }
}

impl TicketReceiver for BackEnd {
    fn receive_ticket(&self, ticket: Ticket) {
        let id = ticket.operation_id;
        if let Some(operation) = self.registry.get(id) {
            operation.receive_ticket(ticket);
            return;
        }
        if ticket.kind.is_abort() {
            debug!(operation_id = %id, kind = ?ticket.kind, "abort for unknown operation dropped");
            return;
        }
        if self.registry.recently_ended(id) {
            debug!(
                operation_id = %id,
                kind = ?ticket.kind,
                sequence_number = ticket.sequence_number,
                "ticket for ended operation dropped"
            );
            return;
        }
        let (operation, created) = self.registry.get_or_insert_with(id, || {
            Operation::back(
                id,
                Arc::clone(&self.servicer),
                self.registry.pool().clone(),
                Arc::clone(&self.link),
                self.config.maximum_timeout,
                self.registry.removal_hook(id),
            )
        });
        if created {
            debug!(operation_id = %id, "operation created by peer");
        }
        operation.receive_ticket(ticket);
        if created {
            operation.arm_default(self.config.clamp_timeout(self.config.default_timeout));
        }
    }
}
