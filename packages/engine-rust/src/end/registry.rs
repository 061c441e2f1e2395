//! Per-end table of live operations.
//!
//! Lookups go through a `DashMap` that is never touched while an operation
//! lock is held by the same call path. The live count is published on a
//! `watch` channel so callers can wait for the end to go idle.
//!
//! Ids of removed operations are remembered for a while so late tickets from
//! the peer cannot bring an operation back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use ticketline_core::{OperationId, Outcome};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::operation::{Operation, Side, TerminationCallback};
use crate::pool::WorkPool;

/// One-shot action run on the pool when the end has no live operations.
pub type IdleAction = Box<dyn FnOnce() + Send + 'static>;

/// Recently ended operation ids, forgotten in the order they were added.
struct EndedIds {
    retention: Duration,
    order: VecDeque<(Instant, OperationId)>,
    ids: HashSet<OperationId>,
}

impl EndedIds {
    fn new(retention: Duration) -> Self {
        Self {
            retention,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(forget_at, id)) = self.order.front() {
            if forget_at > now {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
        }
    }

    fn record(&mut self, id: OperationId, now: Instant) {
        self.evict(now);
        if !self.retention.is_zero() && self.ids.insert(id) {
            self.order.push_back((now + self.retention, id));
        }
    }

    fn contains(&mut self, id: OperationId, now: Instant) -> bool {
        self.evict(now);
        self.ids.contains(&id)
    }
}

pub(crate) struct OperationRegistry {
    side: Side,
    pool: WorkPool,
    operations: DashMap<OperationId, Arc<Operation>>,
    stats: [AtomicU64; Outcome::ALL.len()],
    idle_actions: Mutex<Vec<IdleAction>>,
    live: watch::Sender<usize>,
    ended: Mutex<EndedIds>,
}

impl OperationRegistry {
    /// `retention` is how long a removed id is remembered; zero disables it.
    pub(crate) fn new(side: Side, pool: WorkPool, retention: Duration) -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            side,
            pool,
            operations: DashMap::new(),
            stats: std::array::from_fn(|_| AtomicU64::new(0)),
            idle_actions: Mutex::new(Vec::new()),
            live,
            ended: Mutex::new(EndedIds::new(retention)),
        })
    }

    pub(crate) fn pool(&self) -> &WorkPool {
        &self.pool
    }

    /// Builds the removal hook an operation runs once it is settled.
    pub(crate) fn removal_hook(self: &Arc<Self>, id: OperationId) -> TerminationCallback {
        let registry: Weak<Self> = Arc::downgrade(self);
        Box::new(move |outcome| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id, outcome);
            }
        })
    }

    fn active_gauge(&self) -> metrics::Gauge {
        metrics::gauge!("ticketline_operations_active", "side" => self.side.as_str())
    }

    pub(crate) fn get(&self, id: OperationId) -> Option<Arc<Operation>> {
        self.operations.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn insert(&self, operation: Arc<Operation>) {
        if self.operations.insert(operation.id(), operation).is_none() {
            self.live.send_modify(|live| *live += 1);
            self.active_gauge().increment(1.0);
        }
    }

    /// Returns the operation for `id`, creating it with `create` if absent.
    /// The flag is `true` when this call created it.
    pub(crate) fn get_or_insert_with(
        &self,
        id: OperationId,
        create: impl FnOnce() -> Arc<Operation>,
    ) -> (Arc<Operation>, bool) {
        let mut created = false;
        let operation = Arc::clone(
            self.operations
                .entry(id)
                .or_insert_with(|| {
                    created = true;
                    create()
                })
                .value(),
        );
        if created {
            self.live.send_modify(|live| *live += 1);
            self.active_gauge().increment(1.0);
        }
        (operation, created)
    }

    /// Whether `id` belonged to an operation removed within the retention.
    pub(crate) fn recently_ended(&self, id: OperationId) -> bool {
        self.ended.lock().contains(id, Instant::now())
    }

    fn remove(&self, id: OperationId, outcome: Outcome) {
        if !self.operations.contains_key(&id) {
            return;
        }
        // Recorded before removal so a concurrent lookup that misses the
        // operation always sees the id.
        self.ended.lock().record(id, Instant::now());
        if self.operations.remove(&id).is_none() {
            return;
        }
        self.stats[outcome.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "ticketline_operations_terminated_total",
            "side" => self.side.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        self.active_gauge().decrement(1.0);
        debug!(operation_id = %id, side = self.side.as_str(), %outcome, "operation removed");

        let mut remaining = 0;
        self.live.send_modify(|live| {
            *live = live.saturating_sub(1);
            remaining = *live;
        });
        if remaining == 0 {
            let actions = std::mem::take(&mut *self.idle_actions.lock());
            for action in actions {
                self.spawn_idle_action(action);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        *self.live.borrow()
    }

    /// Runs `action` once the end is idle; right away if it already is.
    pub(crate) fn add_idle_action(&self, action: IdleAction) {
        let mut actions = self.idle_actions.lock();
        if self.len() == 0 {
            drop(actions);
            self.spawn_idle_action(action);
        } else {
            actions.push(action);
        }
    }

    fn spawn_idle_action(&self, action: IdleAction) {
        self.pool.spawn("idle_action", async move {
            action();
            Ok(())
        });
    }

    pub(crate) async fn wait_idle(&self) {
        let mut live = self.live.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = live.wait_for(|live| *live == 0).await;
    }

    pub(crate) fn stats(&self) -> HashMap<Outcome, u64> {
        Outcome::ALL
            .iter()
            .map(|outcome| (*outcome, self.stats[outcome.index()].load(Ordering::Relaxed)))
            .collect()
    }
}
