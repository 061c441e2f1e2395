//! Expiration: the operation's deadline timer.

use std::sync::Arc;
use std::time::Duration;

use ticketline_core::Outcome;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Operation, OperationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed,
    Fired,
    Cancelled,
}

pub(super) struct ExpirationManager {
    state: TimerState,
    generation: u64,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl ExpirationManager {
    pub(super) fn new() -> Self {
        Self {
            state: TimerState::Idle,
            generation: 0,
            deadline: None,
            timer: None,
        }
    }

    /// No deadline has ever been set.
    pub(super) fn is_idle(&self) -> bool {
        self.state == TimerState::Idle
    }

    /// Replaces any pending timer with one for `deadline`. Returns the
    /// generation the new timer must present when it fires.
    fn rearm(&mut self, deadline: Instant) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.state = TimerState::Armed;
        self.deadline = Some(deadline);
        self.generation
    }

    fn set_timer(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    /// Accepts a firing only from the current timer of an armed deadline.
    fn fire(&mut self, generation: u64) -> bool {
        if self.state != TimerState::Armed || generation != self.generation {
            return false;
        }
        self.state = TimerState::Fired;
        self.timer = None;
        true
    }

    pub(super) fn abort(&mut self) {
        if self.state == TimerState::Armed {
            self.state = TimerState::Cancelled;
        }
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub(super) fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Operation {
    /// (Re)arms the deadline `timeout` from now. The caller clamps `timeout`.
    pub(super) fn change_timeout_locked(
        self: &Arc<Self>,
        st: &mut OperationState,
        timeout: Duration,
    ) {
        if !st.termination.is_active() {
            return;
        }
        let deadline = Instant::now() + timeout;
        let generation = st.expiration.rearm(deadline);
        debug!(operation_id = %self.id, ?timeout, "deadline armed");
        let operation = Arc::downgrade(self);
        let timer = self.pool.spawn_timer(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(operation) = operation.upgrade() {
                operation.expire(generation);
            }
        });
        st.expiration.set_timer(timer);
    }

    fn expire(self: &Arc<Self>, generation: u64) {
        let mut st = self.state.lock();
        if st.expiration.fire(generation) {
            warn!(
                operation_id = %self.id,
                side = self.side.as_str(),
                "operation deadline elapsed"
            );
            self.abort_locked(&mut st, Outcome::Expired, true);
        }
    }

    pub(crate) fn time_remaining(&self) -> Option<Duration> {
        self.state.lock().expiration.time_remaining()
    }
}
