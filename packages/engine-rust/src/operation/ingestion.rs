//! Ingestion: feeding received payloads into customer code on the pool.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use ticketline_core::{Outcome, Payload};
use tracing::{debug, warn};

use super::context::{Emitter, OperationContext};
use super::{Operation, OperationState};
use crate::error::{ConsumerError, ServicerError};
use crate::traits::Consumer;

/// One unit of work for the consumer.
#[derive(Debug)]
pub(super) enum Feed {
    Consume(Payload),
    Terminate,
    ConsumeAndTerminate(Payload),
}

impl Feed {
    fn is_terminal(&self) -> bool {
        !matches!(self, Feed::Consume(_))
    }
}

enum Slot {
    /// The back's servicer has not produced a consumer yet.
    Unstarted,
    Ready(Box<dyn Consumer>),
    /// The consumer is out on the pool.
    Busy,
    /// No local subscriber: data is dropped, termination still counts.
    Discard,
    Closed,
}

/// Work handed to the pool-resident feeding loop.
pub(super) enum Work {
    Start(String),
    Feed(Box<dyn Consumer>, Feed),
}

/// Result of offering a feed.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Offer {
    Queued,
    Dropped,
    /// A terminal feed with no consumer to run it; ingestion is done.
    Completed,
}

pub(super) struct IngestionManager {
    slot: Slot,
    queue: VecDeque<Feed>,
    start: Option<String>,
    running: bool,
}

impl IngestionManager {
    pub(super) fn front(consumer: Option<Box<dyn Consumer>>) -> Self {
        Self::with_slot(consumer.map_or(Slot::Discard, Slot::Ready))
    }

    pub(super) fn back() -> Self {
        Self::with_slot(Slot::Unstarted)
    }

    fn with_slot(slot: Slot) -> Self {
        Self {
            slot,
            queue: VecDeque::new(),
            start: None,
            running: false,
        }
    }

    /// Requests that the servicer be started for method `name`.
    pub(super) fn start(&mut self, name: String) {
        if matches!(self.slot, Slot::Unstarted) {
            self.start = Some(name);
        }
    }

    pub(super) fn offer(&mut self, feed: Feed) -> Offer {
        match self.slot {
            Slot::Closed => Offer::Dropped,
            Slot::Discard if feed.is_terminal() => {
                self.slot = Slot::Closed;
                Offer::Completed
            }
            Slot::Discard => Offer::Dropped,
            Slot::Unstarted | Slot::Ready(_) | Slot::Busy => {
                self.queue.push_back(feed);
                Offer::Queued
            }
        }
    }

    /// Hands out the next unit of work unless the loop is already running.
    pub(super) fn next_work(&mut self) -> Option<Work> {
        if self.running {
            return None;
        }
        if let Some(name) = self.start.take() {
            self.slot = Slot::Busy;
            self.running = true;
            return Some(Work::Start(name));
        }
        if self.queue.is_empty() || !matches!(self.slot, Slot::Ready(_)) {
            return None;
        }
        let Slot::Ready(consumer) = std::mem::replace(&mut self.slot, Slot::Busy) else {
            return None;
        };
        let feed = self.queue.pop_front()?;
        self.running = true;
        Some(Work::Feed(consumer, feed))
    }

    /// Returns the consumer after a successful start or non-terminal feed.
    /// Hands it back if ingestion was aborted in the meantime.
    fn restore(&mut self, consumer: Box<dyn Consumer>) -> Option<Box<dyn Consumer>> {
        self.running = false;
        if matches!(self.slot, Slot::Busy) {
            self.slot = Slot::Ready(consumer);
            None
        } else {
            Some(consumer)
        }
    }

    fn finish(&mut self) {
        self.running = false;
        self.slot = Slot::Closed;
        self.queue.clear();
    }

    /// Drops pending feeds. Returns the idle consumer, if one was parked.
    pub(super) fn abort(&mut self) -> Option<Box<dyn Consumer>> {
        self.queue.clear();
        self.start = None;
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Ready(consumer) => Some(consumer),
            Slot::Unstarted | Slot::Busy | Slot::Discard | Slot::Closed => None,
        }
    }
}

async fn feed_consumer(consumer: &mut dyn Consumer, feed: Feed) -> Result<(), ConsumerError> {
    match feed {
        Feed::Consume(payload) => consumer.consume(payload).await,
        Feed::Terminate => consumer.terminate().await,
        Feed::ConsumeAndTerminate(payload) => consumer.consume_and_terminate(payload).await,
    }
}

impl Operation {
    /// Starts the feeding loop if there is work and it is not running.
    pub(super) fn pump_ingestion_locked(self: &Arc<Self>, st: &mut OperationState) {
        if let Some(work) = st.ingestion.next_work() {
            let operation = Arc::clone(self);
            self.pool.spawn("ingestion", operation.ingest(work));
        }
    }

    /// Hands a consumer to the pool so its destructor runs outside the lock.
    pub(super) fn retire_consumer(&self, consumer: Box<dyn Consumer>) {
        self.pool.spawn("retire_consumer", async move {
            drop(consumer);
            Ok(())
        });
    }

    async fn ingest(self: Arc<Self>, work: Work) -> anyhow::Result<()> {
        let mut work = Some(work);
        while let Some(current) = work.take() {
            work = match current {
                Work::Start(name) => self.start_servicer(name).await?,
                Work::Feed(consumer, feed) => self.feed(consumer, feed).await,
            };
        }
        Ok(())
    }

    async fn start_servicer(self: &Arc<Self>, name: String) -> anyhow::Result<Option<Work>> {
        let Some(servicer) = self.servicer.clone() else {
            self.abort(Outcome::ServicerFailure);
            anyhow::bail!("operation {} has no servicer", self.id);
        };
        let context = OperationContext::new(Arc::clone(self));
        let emitter = Emitter::new(Arc::clone(self));
        debug!(operation_id = %self.id, method = %name, "starting servicer");
        let result = AssertUnwindSafe(servicer.service(&name, context, emitter))
            .catch_unwind()
            .await;

        let mut st = self.state.lock();
        let outcome = match result {
            Ok(Ok(consumer)) => {
                if let Some(consumer) = st.ingestion.restore(consumer) {
                    self.retire_consumer(consumer);
                    return Ok(None);
                }
                return Ok(st.ingestion.next_work());
            }
            Ok(Err(ServicerError::NoSuchMethod(method))) => {
                warn!(operation_id = %self.id, %method, "no such method");
                Outcome::ReceptionFailure
            }
            Ok(Err(ServicerError::Failed(reason))) => {
                warn!(operation_id = %self.id, method = %name, %reason, "servicer failed to start");
                Outcome::ServicerFailure
            }
            Err(_) => {
                warn!(operation_id = %self.id, method = %name, "servicer panicked while starting");
                Outcome::ServicerFailure
            }
        };
        st.ingestion.finish();
        self.abort_locked(&mut st, outcome, true);
        Ok(None)
    }

    async fn feed(self: &Arc<Self>, mut consumer: Box<dyn Consumer>, feed: Feed) -> Option<Work> {
        let terminal = feed.is_terminal();
        let result = AssertUnwindSafe(feed_consumer(consumer.as_mut(), feed))
            .catch_unwind()
            .await;

        let mut st = self.state.lock();
        let failure = match result {
            Ok(Ok(())) if terminal => {
                st.ingestion.finish();
                self.retire_consumer(consumer);
                self.complete_ingestion_locked(&mut st);
                return None;
            }
            Ok(Ok(())) => {
                if let Some(consumer) = st.ingestion.restore(consumer) {
                    self.retire_consumer(consumer);
                    return None;
                }
                return st.ingestion.next_work();
            }
            Ok(Err(ConsumerError::Abandoned)) => {
                debug!(operation_id = %self.id, "consumer abandoned the operation");
                None
            }
            Ok(Err(ConsumerError::Failed(reason))) => Some(reason),
            Err(_) => Some("consumer panicked".to_owned()),
        };
        st.ingestion.finish();
        self.retire_consumer(consumer);
        if let Some(reason) = &failure {
            warn!(operation_id = %self.id, side = self.side.as_str(), %reason, "consumer failed");
        }
        self.abort_locked(&mut st, self.side.local_failure(), true);
        None
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct Nop;

    #[async_trait]
    impl Consumer for Nop {
        async fn consume(&mut self, _payload: Payload) -> Result<(), ConsumerError> {
            Ok(())
        }

        async fn terminate(&mut self) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    fn payload() -> Payload {
        Payload::from_static(b"p")
    }

    #[test]
    fn front_without_consumer_completes_on_terminal_feed() {
        let mut ingestion = IngestionManager::front(None);
        assert_eq!(ingestion.offer(Feed::Consume(payload())), Offer::Dropped);
        assert_eq!(ingestion.offer(Feed::Terminate), Offer::Completed);
        assert_eq!(ingestion.offer(Feed::Terminate), Offer::Dropped);
    }

    #[test]
    fn back_starts_before_feeding() {
        let mut ingestion = IngestionManager::back();
        assert_eq!(ingestion.offer(Feed::ConsumeAndTerminate(payload())), Offer::Queued);
        assert!(ingestion.next_work().is_none(), "nothing to feed before start");

        ingestion.start("echo".into());
        assert!(matches!(ingestion.next_work(), Some(Work::Start(name)) if name == "echo"));
        assert!(ingestion.next_work().is_none(), "start is running");

        assert!(ingestion.restore(Box::new(Nop)).is_none());
        assert!(matches!(
            ingestion.next_work(),
            Some(Work::Feed(_, Feed::ConsumeAndTerminate(_)))
        ));
    }

    #[test]
    fn feeds_go_out_one_at_a_time_in_order() {
        let mut ingestion = IngestionManager::front(Some(Box::new(Nop)));
        ingestion.offer(Feed::Consume(Payload::from_static(b"a")));
        ingestion.offer(Feed::Consume(Payload::from_static(b"b")));

        let Some(Work::Feed(consumer, Feed::Consume(first))) = ingestion.next_work() else {
            panic!("expected the first feed");
        };
        assert_eq!(&first[..], b"a");
        assert!(ingestion.next_work().is_none());

        assert!(ingestion.restore(consumer).is_none());
        let Some(Work::Feed(_, Feed::Consume(second))) = ingestion.next_work() else {
            panic!("expected the second feed");
        };
        assert_eq!(&second[..], b"b");
    }

    #[test]
    fn abort_while_busy_hands_back_the_consumer_later() {
        let mut ingestion = IngestionManager::front(Some(Box::new(Nop)));
        ingestion.offer(Feed::Consume(payload()));
        ingestion.offer(Feed::Terminate);
        let Some(Work::Feed(consumer, _)) = ingestion.next_work() else {
            panic!("expected a feed");
        };

        assert!(ingestion.abort().is_none());
        assert!(ingestion.restore(consumer).is_some());
        assert!(ingestion.next_work().is_none());
        assert_eq!(ingestion.offer(Feed::Terminate), Offer::Dropped);
    }

    #[test]
    fn abort_returns_parked_consumer() {
        let mut ingestion = IngestionManager::front(Some(Box::new(Nop)));
        assert!(ingestion.abort().is_some());
        assert!(ingestion.abort().is_none());
    }
}
