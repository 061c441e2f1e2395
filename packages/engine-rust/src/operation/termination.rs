//! Termination: the single terminal outcome of an operation.

use std::sync::Arc;

use ticketline_core::Outcome;

use super::{Operation, OperationState};

/// One-shot notification run on the pool with the terminal outcome.
pub(crate) type TerminationCallback = Box<dyn FnOnce(Outcome) + Send + 'static>;

pub(super) struct TerminationManager {
    outcome: Option<Outcome>,
    transmission_pending: bool,
    ingestion_pending: bool,
    callbacks: Vec<TerminationCallback>,
    action: Option<TerminationCallback>,
}

impl TerminationManager {
    /// `action` is the owner's removal hook. It runs exactly once, after the
    /// outcome is recorded and no outbound ticket is in flight.
    pub(super) fn new(
        requires_transmission: bool,
        requires_ingestion: bool,
        action: TerminationCallback,
    ) -> Self {
        Self {
            outcome: None,
            transmission_pending: requires_transmission,
            ingestion_pending: requires_ingestion,
            callbacks: Vec::new(),
            action: Some(action),
        }
    }

    pub(super) fn is_active(&self) -> bool {
        self.outcome.is_none()
    }

    pub(super) fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Records `outcome` unless one is already recorded. Returns the
    /// callbacks to notify, or `None` if this call changed nothing.
    pub(super) fn abort(&mut self, outcome: Outcome) -> Option<Vec<TerminationCallback>> {
        if self.outcome.is_some() {
            return None;
        }
        self.outcome = Some(outcome);
        Some(std::mem::take(&mut self.callbacks))
    }

    pub(super) fn ingestion_complete(&mut self) -> Option<Vec<TerminationCallback>> {
        if self.outcome.is_some() {
            return None;
        }
        self.ingestion_pending = false;
        self.complete_if_done()
    }

    pub(super) fn transmission_complete(&mut self) -> Option<Vec<TerminationCallback>> {
        if self.outcome.is_some() {
            return None;
        }
        self.transmission_pending = false;
        self.complete_if_done()
    }

    fn complete_if_done(&mut self) -> Option<Vec<TerminationCallback>> {
        if self.transmission_pending || self.ingestion_pending {
            return None;
        }
        self.abort(Outcome::Completed)
    }

    /// Registers `callback`, or hands it back with the outcome when the
    /// operation has already terminated.
    pub(super) fn add_callback(
        &mut self,
        callback: TerminationCallback,
    ) -> Option<(TerminationCallback, Outcome)> {
        match self.outcome {
            Some(outcome) => Some((callback, outcome)),
            None => {
                self.callbacks.push(callback);
                None
            }
        }
    }

    /// Takes the owner's action once the operation is settled.
    pub(super) fn take_action(
        &mut self,
        transmission_idle: bool,
    ) -> Option<(TerminationCallback, Outcome)> {
        let outcome = self.outcome?;
        if !transmission_idle {
            return None;
        }
        self.action.take().map(|action| (action, outcome))
    }
}

impl Operation {
    pub(super) fn notify_terminated(&self, outcome: Outcome, callbacks: Vec<TerminationCallback>) {
        for callback in callbacks {
            self.pool.spawn("termination_callback", async move {
                callback(outcome);
                Ok(())
            });
        }
    }

    /// Runs the owner's action if the outcome is recorded and transmission
    /// has gone quiet.
    pub(super) fn finish_if_settled(&self, st: &mut OperationState) {
        let idle = st.transmission.is_idle();
        if let Some((action, outcome)) = st.termination.take_action(idle) {
            self.pool.spawn("termination_action", async move {
                action(outcome);
                Ok(())
            });
        }
    }

    pub(crate) fn add_termination_callback(self: &Arc<Self>, callback: TerminationCallback) {
        let late = self.state.lock().termination.add_callback(callback);
        if let Some((callback, outcome)) = late {
            self.notify_terminated(outcome, vec![callback]);
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().termination.is_active()
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.state.lock().termination.outcome()
    }
}
