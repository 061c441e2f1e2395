//! Deadlines, run on a paused clock.

mod common;

use std::time::Duration;

use common::{count, lone_front, outcome_of, within, Harness, Recorder, Relay};
use ticketline_engine::{EngineConfig, Outcome, Payload, Subscription, TicketKind};

#[tokio::test(start_paused = true)]
async fn lone_front_expires_and_tells_the_peer() {
    let link = Relay::new();
    let front = lone_front(&link);
    let handle = front.operate(
        "slow",
        Some(Payload::from_static(b"p")),
        false,
        Some(Duration::from_secs(1)),
        Subscription::TerminationOnly,
        None,
    );

    assert_eq!(outcome_of(handle.context()).await, Outcome::Expired);
    within(front.wait_idle()).await;

    let sent = link.sent();
    assert_eq!(sent[0].kind, TicketKind::Commencement);
    assert_eq!(sent[0].timeout, Some(Duration::from_secs(1)));
    assert_eq!(sent[1].kind, TicketKind::Expiration);
    assert_eq!(sent[1].sequence_number, 1);
    assert_eq!(count(&front.operation_stats(), Outcome::Expired), 1);
}

#[tokio::test(start_paused = true)]
async fn both_sides_expire() {
    let harness = Harness::new();
    let handle = harness.front.operate(
        "stall",
        Some(Payload::from_static(b"p")),
        false,
        Some(Duration::from_secs(1)),
        Subscription::full(Recorder::default()),
        None,
    );

    assert_eq!(outcome_of(handle.context()).await, Outcome::Expired);
    harness.settle().await;
    assert_eq!(count(&harness.front.operation_stats(), Outcome::Expired), 1);
    assert_eq!(count(&harness.back.operation_stats(), Outcome::Expired), 1);
}

#[tokio::test(start_paused = true)]
async fn requested_timeouts_are_clamped() {
    let harness = Harness::with_config(EngineConfig {
        maximum_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    });
    let handle = harness.front.operate(
        "stall",
        None,
        false,
        Some(Duration::from_secs(3600)),
        Subscription::full(Recorder::default()),
        None,
    );

    assert!(handle.context().time_remaining() <= Some(Duration::from_secs(2)));
    assert_eq!(outcome_of(handle.context()).await, Outcome::Expired);
    assert_eq!(
        harness.uplink.sent()[0].timeout,
        Some(Duration::from_secs(2))
    );
    harness.settle().await;
}

#[tokio::test(start_paused = true)]
async fn renegotiated_deadline_reaches_the_back() {
    let harness = Harness::new();
    let handle = harness.front.operate(
        "stall",
        None,
        false,
        Some(Duration::from_secs(10)),
        Subscription::full(Recorder::default()),
        None,
    );
    harness.servicer.wait_started(1).await;
    let back = harness.servicer.contexts()[0].clone();

    handle.context().change_timeout(Duration::from_secs(60));
    harness.uplink.wait_for_sent(2).await;
    let renegotiation = &harness.uplink.sent()[1];
    assert_eq!(renegotiation.kind, TicketKind::Continuation);
    assert_eq!(renegotiation.timeout, Some(Duration::from_secs(60)));
    assert!(renegotiation.payload.is_none());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(handle.context().is_active());
    assert!(back.is_active());
    let remaining = back.time_remaining().unwrap();
    assert!(remaining > Duration::from_secs(30) && remaining <= Duration::from_secs(40));

    handle.cancel();
    assert_eq!(outcome_of(&back).await, Outcome::Cancelled);
    harness.settle().await;
}

#[tokio::test(start_paused = true)]
async fn back_uses_the_default_deadline_without_one_on_the_wire() {
    use std::sync::Arc;

    use ticketline_engine::{OperationId, Ticket, TicketReceiver};

    let link = Relay::new();
    let servicer = Arc::new(common::TestServicer::default());
    let back = common::lone_back(&link, &servicer);

    back.receive_ticket(
        Ticket::new(OperationId::random(), 0, TicketKind::Commencement).with_name("stall"),
    );
    servicer.wait_started(1).await;
    let context = servicer.contexts()[0].clone();
    assert!(context.time_remaining() <= Some(EngineConfig::default().default_timeout));

    assert_eq!(outcome_of(&context).await, Outcome::Expired);
    within(back.wait_idle()).await;
    assert_eq!(link.kinds(), vec![TicketKind::Expiration]);
}
