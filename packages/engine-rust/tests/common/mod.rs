//! Shared harness: an in-process relay link, recording consumers, and a
//! servicer with a handful of scripted methods.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ticketline_engine::{
    BackEnd, Consumer, ConsumerError, EngineConfig, Emitter, FrontEnd, OperationContext, Outcome,
    Payload, Servicer, ServicerError, Ticket, TicketKind, TicketReceiver, TicketSink, WorkPool,
};
use tokio::sync::{oneshot, watch, Semaphore};

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(300), future)
        .await
        .expect("timed out")
}

/// Resolves with the operation's terminal outcome.
pub async fn outcome_of(context: &OperationContext) -> Outcome {
    let (tx, rx) = oneshot::channel();
    context.add_termination_callback(move |outcome| {
        let _ = tx.send(outcome);
    });
    within(rx).await.expect("termination callback dropped")
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Link that records every ticket and forwards it to the connected end.
pub struct Relay {
    target: OnceLock<Arc<dyn TicketReceiver>>,
    sent: Mutex<Vec<Ticket>>,
    sent_count: watch::Sender<usize>,
    gate: Option<Semaphore>,
    failing: AtomicBool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Relay {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Every send waits for a permit from [`Relay::release`].
    pub fn gated() -> Arc<Self> {
        Self::build(Some(Semaphore::new(0)))
    }

    fn build(gate: Option<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            target: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            sent_count: watch::channel(0).0,
            gate,
            failing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn connect(&self, target: Arc<dyn TicketReceiver>) {
        assert!(self.target.set(target).is_ok(), "relay already connected");
    }

    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn sent(&self) -> Vec<Ticket> {
        self.sent.lock().clone()
    }

    pub fn kinds(&self) -> Vec<TicketKind> {
        self.sent.lock().iter().map(|t| t.kind).collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` tickets have been handed to the relay.
    pub async fn wait_for_sent(&self, count: usize) {
        let mut sent = self.sent_count.subscribe();
        within(sent.wait_for(|n| *n >= count))
            .await
            .expect("relay dropped");
    }
}

#[async_trait]
impl TicketSink for Relay {
    async fn send(&self, ticket: Ticket) -> anyhow::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.sent.lock().push(ticket.clone());
        self.sent_count.send_modify(|n| *n += 1);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("link down");
        }
        if let Some(target) = self.target.get() {
            target.receive_ticket(ticket);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Payload(Payload),
    Terminated,
}

pub fn payload(bytes: &'static [u8]) -> Event {
    Event::Payload(Payload::from_static(bytes))
}

/// Consumer that records what it is fed.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Consumer for Recorder {
    async fn consume(&mut self, payload: Payload) -> Result<(), ConsumerError> {
        self.events.lock().push(Event::Payload(payload));
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), ConsumerError> {
        self.events.lock().push(Event::Terminated);
        Ok(())
    }
}

/// Records, then completes its operation's emission on termination.
struct RecordThenComplete {
    recorder: Recorder,
    emitter: Emitter,
}

#[async_trait]
impl Consumer for RecordThenComplete {
    async fn consume(&mut self, payload: Payload) -> Result<(), ConsumerError> {
        self.recorder.consume(payload).await
    }

    async fn terminate(&mut self) -> Result<(), ConsumerError> {
        self.recorder.terminate().await?;
        self.emitter.complete()
    }
}

/// Fails on the first payload.
pub struct Failing;

#[async_trait]
impl Consumer for Failing {
    async fn consume(&mut self, _payload: Payload) -> Result<(), ConsumerError> {
        Err(ConsumerError::Failed("rejected payload".into()))
    }

    async fn terminate(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// Panics on the first payload.
struct Panicking;

#[async_trait]
impl Consumer for Panicking {
    async fn consume(&mut self, _payload: Payload) -> Result<(), ConsumerError> {
        panic!("consumer blew up");
    }

    async fn terminate(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Servicer
// ---------------------------------------------------------------------------

/// Methods:
/// - `echo`: sends every payload straight back.
/// - `record`: records into `recorder`, completes when the front does.
/// - `stall`: records, never completes.
/// - `explode`: consumer fails on the first payload.
/// - `panic`: consumer panics on the first payload.
/// - `broken`: fails to start.
#[derive(Default)]
pub struct TestServicer {
    pub recorder: Recorder,
    contexts: Mutex<Vec<OperationContext>>,
    started: AtomicUsize,
}

impl TestServicer {
    pub fn contexts(&self) -> Vec<OperationContext> {
        self.contexts.lock().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits until the servicer has been asked to start `count` operations.
    pub async fn wait_started(&self, count: usize) {
        within(async {
            while self.started() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
    }
}

#[async_trait]
impl Servicer for TestServicer {
    async fn service(
        &self,
        name: &str,
        context: OperationContext,
        emitter: Emitter,
    ) -> Result<Box<dyn Consumer>, ServicerError> {
        self.contexts.lock().push(context);
        self.started.fetch_add(1, Ordering::SeqCst);
        let recorder = self.recorder.clone();
        match name {
            "echo" => Ok(Box::new(emitter)),
            "record" => Ok(Box::new(RecordThenComplete { recorder, emitter })),
            "stall" => Ok(Box::new(recorder)),
            "explode" => Ok(Box::new(Failing)),
            "panic" => Ok(Box::new(Panicking)),
            "broken" => Err(ServicerError::Failed("could not start".into())),
            other => Err(ServicerError::NoSuchMethod(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A front and a back joined by two relays.
pub struct Harness {
    pub front: Arc<FrontEnd>,
    pub back: Arc<BackEnd>,
    /// Front to back.
    pub uplink: Arc<Relay>,
    /// Back to front.
    pub downlink: Arc<Relay>,
    pub servicer: Arc<TestServicer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let pool = WorkPool::from_config(&config).unwrap();
        let uplink = Relay::new();
        let downlink = Relay::new();
        let servicer = Arc::new(TestServicer::default());
        let front = Arc::new(FrontEnd::new(
            Arc::clone(&config),
            pool.clone(),
            Arc::clone(&uplink) as Arc<dyn TicketSink>,
        ));
        let back = Arc::new(BackEnd::new(
            config,
            pool,
            Arc::clone(&downlink) as Arc<dyn TicketSink>,
            Arc::clone(&servicer) as Arc<dyn Servicer>,
        ));
        uplink.connect(Arc::clone(&back) as Arc<dyn TicketReceiver>);
        downlink.connect(Arc::clone(&front) as Arc<dyn TicketReceiver>);
        Self {
            front,
            back,
            uplink,
            downlink,
            servicer,
        }
    }

    /// Waits for the front, then the back, to have no live operations.
    pub async fn settle(&self) {
        within(self.front.wait_idle()).await;
        within(self.back.wait_idle()).await;
    }
}

/// A lone front whose link only records.
pub fn lone_front(link: &Arc<Relay>) -> FrontEnd {
    FrontEnd::new(
        Arc::new(EngineConfig::default()),
        WorkPool::current(None).unwrap(),
        Arc::clone(link) as Arc<dyn TicketSink>,
    )
}

/// A lone back whose link only records.
pub fn lone_back(link: &Arc<Relay>, servicer: &Arc<TestServicer>) -> BackEnd {
    BackEnd::new(
        Arc::new(EngineConfig::default()),
        WorkPool::current(None).unwrap(),
        Arc::clone(link) as Arc<dyn TicketSink>,
        Arc::clone(servicer) as Arc<dyn Servicer>,
    )
}

pub fn count(stats: &std::collections::HashMap<Outcome, u64>, outcome: Outcome) -> u64 {
    stats.get(&outcome).copied().unwrap_or_default()
}
