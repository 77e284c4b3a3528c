//! Concurrent sends while the transport is swapped underneath them
//!
//! Every send that returns Ok must be recorded by exactly one transport, and
//! every retired transport must end up closed.

use event_transport::test_utils::{init_test_tracing, ManualMemorySampler, MockTransport};
use event_transport::{
    ConnectionState, Event, ManagerConfig, ManagerState, Transport, TransportError, TransportEvent,
    TransportManager,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const SENDERS: usize = 8;
const SENDS_PER_TASK: usize = 200;
const SWAPS: usize = 10;

fn manager() -> TransportManager<TransportEvent> {
    let sampler = Arc::new(ManualMemorySampler::new(1 << 30));
    TransportManager::with_sampler("hot-swap", ManagerConfig::default(), sampler)
        .expect("valid config")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sends_during_swaps_are_delivered_at_most_once() {
    init_test_tracing();
    let manager = manager();

    let first = Arc::new(MockTransport::with_capacity(100_000));
    manager.set_transport(first.clone()).await.unwrap();
    manager.start().await.unwrap();

    let mut handles = Vec::new();
    for task in 0..SENDERS {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let mut accepted = Vec::new();
            for i in 0..SENDS_PER_TASK {
                let event = TransportEvent::with_id(format!("{task}-{i}"), "tick", &b"x"[..]);
                match manager.send(event).await {
                    Ok(()) => accepted.push(format!("{task}-{i}")),
                    Err(TransportError::NotConnected) => {}
                    Err(e) => panic!("unexpected send error: {e}"),
                }
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            accepted
        }));
    }

    let mut transports = vec![first];
    for _ in 0..SWAPS {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let next = Arc::new(MockTransport::with_capacity(100_000));
        manager.set_transport(next.clone()).await.unwrap();
        transports.push(next);
    }

    let mut accepted = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(accepted.insert(id), "send reported twice");
        }
    }

    let mut delivered = HashSet::new();
    for transport in &transports {
        for id in transport.sent_ids() {
            assert!(delivered.insert(id.clone()), "event {id} delivered twice");
        }
    }
    assert_eq!(accepted, delivered);

    // All but the last were retired and closed exactly once
    for transport in &transports[..transports.len() - 1] {
        assert!(!transport.is_connected());
        assert_eq!(transport.close_count(), 1);
    }
    assert!(transports[SWAPS].is_connected());

    let metrics = manager.get_metrics();
    assert_eq!(metrics.transport_switches, SWAPS as u64);
    assert_eq!(metrics.events_sent, accepted.len() as u64);
    assert_eq!(manager.connection_state(), ConnectionState::Connected);

    manager.stop().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(transports[SWAPS].close_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_flow_follows_the_active_transport() {
    init_test_tracing();
    let manager = manager();
    let first = Arc::new(MockTransport::with_name("first"));
    let second = Arc::new(MockTransport::with_name("second"));

    manager.set_transport(first.clone()).await.unwrap();
    manager.start().await.unwrap();
    let events = manager.receive();

    first.inject_event(TransportEvent::with_id("a", "quote", &b"1"[..]));
    let got = events.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(got.id(), "a");

    manager.set_transport(second.clone()).await.unwrap();
    assert_eq!(manager.transport_name().as_deref(), Some("second"));

    // The retired transport no longer feeds the manager
    first.inject_event(TransportEvent::with_id("stale", "quote", &b"2"[..]));
    second.inject_event(TransportEvent::with_id("b", "quote", &b"3"[..]));
    let got = events.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(got.id(), "b");
    assert!(events.try_recv().is_err());

    // The old stream ending is not a connection loss for the new one
    first.end_stream();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.state(), ManagerState::Running);

    manager.stop().await.unwrap();
}
