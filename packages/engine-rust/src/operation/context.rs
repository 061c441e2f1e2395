//! Customer-facing handles onto a running operation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ticketline_core::{OperationId, Outcome, Payload};
use tracing::{info, warn};
use uuid::Uuid;

use super::Operation;
use crate::error::ConsumerError;
use crate::traits::Consumer;

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Read access and control over one operation.
///
/// Handed to the servicer on the back and returned inside an
/// [`OperationHandle`] on the front. Cheap to clone.
#[derive(Clone)]
pub struct OperationContext {
    operation: Arc<Operation>,
}

impl OperationContext {
    pub(crate) fn new(operation: Arc<Operation>) -> Self {
        Self { operation }
    }

    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.operation.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.operation.is_active()
    }

    /// The terminal outcome, once recorded.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.operation.outcome()
    }

    /// Time left until the deadline; `None` if no deadline was ever set.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        self.operation.time_remaining()
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<Uuid> {
        self.operation.state.lock().trace_id
    }

    /// Aborts the operation with [`Outcome::Cancelled`] and tells the peer.
    pub fn cancel(&self) {
        info!(operation_id = %self.operation.id, "operation cancelled locally");
        self.operation.abort(Outcome::Cancelled);
    }

    /// Aborts the operation as a failure of this side's customer code.
    pub fn fail(&self, reason: &str) {
        warn!(operation_id = %self.operation.id, reason, "operation failed by customer code");
        self.operation.abort(self.operation.side.local_failure());
    }

    /// Moves the deadline to `timeout` from now, clamped to the configured
    /// maximum. On the front the new deadline is also sent to the back.
    pub fn change_timeout(&self, timeout: Duration) {
        self.operation.change_timeout(timeout);
    }

    /// Runs `callback` on the pool with the outcome once the operation
    /// terminates, or right away if it already has.
    pub fn add_termination_callback<F>(&self, callback: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.operation.add_termination_callback(Box::new(callback));
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation_id", &self.operation.id)
            .field("side", &self.operation.side)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Sends this side's payloads to the peer, in order.
///
/// Implements [`Consumer`] so a servicer can hand one stream straight to
/// another operation's emitter.
#[derive(Clone)]
pub struct Emitter {
    operation: Arc<Operation>,
}

impl Emitter {
    pub(crate) fn new(operation: Arc<Operation>) -> Self {
        Self { operation }
    }

    /// Queues `payload` for transmission.
    ///
    /// # Errors
    ///
    /// `Abandoned` if the operation is over; `Failed` if emission was
    /// already completed, which also aborts the operation.
    pub fn emit(&self, payload: impl Into<Payload>) -> Result<(), ConsumerError> {
        self.operation.emit(Some(payload.into()), false)
    }

    /// Queues `payload` as the last one.
    ///
    /// # Errors
    ///
    /// Same as [`Emitter::emit`].
    pub fn emit_and_complete(&self, payload: impl Into<Payload>) -> Result<(), ConsumerError> {
        self.operation.emit(Some(payload.into()), true)
    }

    /// Ends emission without a further payload.
    ///
    /// # Errors
    ///
    /// Same as [`Emitter::emit`].
    pub fn complete(&self) -> Result<(), ConsumerError> {
        self.operation.emit(None, true)
    }
}

#[async_trait]
impl Consumer for Emitter {
    async fn consume(&mut self, payload: Payload) -> Result<(), ConsumerError> {
        self.emit(payload)
    }

    async fn terminate(&mut self) -> Result<(), ConsumerError> {
        self.complete()
    }

    async fn consume_and_terminate(&mut self, payload: Payload) -> Result<(), ConsumerError> {
        self.emit_and_complete(payload)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("operation_id", &self.operation.id)
            .finish_non_exhaustive()
    }
}

impl Operation {
    fn emit(
        self: &Arc<Self>,
        payload: Option<Payload>,
        complete: bool,
    ) -> Result<(), ConsumerError> {
        let mut st = self.state.lock();
        if !st.termination.is_active() {
            return Err(ConsumerError::Abandoned);
        }
        if st.transmission.is_emission_complete() {
            warn!(operation_id = %self.id, side = self.side.as_str(), "emission after completion");
            self.abort_locked(&mut st, self.side.local_failure(), true);
            return Err(ConsumerError::Failed("emission already completed".to_owned()));
        }
        st.transmission.emit(payload, complete);
        self.pump_transmission_locked(&mut st);
        Ok(())
    }

    fn change_timeout(self: &Arc<Self>, timeout: Duration) {
        let timeout = timeout.min(self.maximum_timeout);
        let mut st = self.state.lock();
        if !st.termination.is_active() {
            return;
        }
        self.change_timeout_locked(&mut st, timeout);
        st.transmission.renegotiate(timeout);
        self.pump_transmission_locked(&mut st);
    }
}

// ---------------------------------------------------------------------------
// OperationHandle
// ---------------------------------------------------------------------------

/// What `FrontEnd::operate` returns: control of the call plus the sink for
/// further payloads.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    context: OperationContext,
    emitter: Emitter,
}

impl OperationHandle {
    pub(crate) fn new(operation: &Arc<Operation>) -> Self {
        Self {
            context: OperationContext::new(Arc::clone(operation)),
            emitter: Emitter::new(Arc::clone(operation)),
        }
    }

    #[must_use]
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    #[must_use]
    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.context.operation_id()
    }

    pub fn cancel(&self) {
        self.context.cancel();
    }
}
