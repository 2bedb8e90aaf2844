use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use channel_registry::{AcquireError, ChannelRegistry, ChannelState, RegistryConfig};
use realtime_bus::{ChangeEvent, ChangeKind, HandshakeScript, ListenerConfig, LocalRealtime};
use serde_json::json;
use test_timeout::tokio_timeout_test;

fn registry(transport: &LocalRealtime, handshake_timeout: Duration) -> ChannelRegistry {
    ChannelRegistry::new(
        Arc::new(transport.clone()),
        RegistryConfig { handshake_timeout },
    )
}

fn counting_listener(resource: &str, hits: &Arc<AtomicUsize>) -> ListenerConfig {
    let hits = hits.clone();
    ListenerConfig::new(resource, move |_: &ChangeEvent| {
        hits.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio_timeout_test(5, paused)]
async fn concurrent_acquires_share_one_handshake() {
    let transport = LocalRealtime::new();
    transport.set_handshake(HandshakeScript::AckAfter(Duration::from_millis(200)));
    let registry = registry(&transport, Duration::from_secs(10));

    let (first, second) = tokio::join!(
        registry.acquire("messages:thread_id=eq.42", Vec::new()),
        registry.acquire("messages:thread_id=eq.42", Vec::new()),
    );
    let first = first.expect("first acquire");
    let second = second.expect("second acquire");

    assert_eq!(transport.handshakes(), 1);
    assert!(first.same_channel(&second));
    assert_eq!(first.state(), ChannelState::Subscribed);
    assert_eq!(
        registry.state_of("messages:thread_id=eq.42"),
        Some(ChannelState::Subscribed)
    );

    let third = registry
        .acquire("messages:thread_id=eq.42", Vec::new())
        .await
        .expect("cached");
    assert!(third.same_channel(&first));
    assert_eq!(transport.handshakes(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio_timeout_test(5)]
async fn listeners_are_attached_once_per_channel() {
    let transport = LocalRealtime::new();
    let registry = registry(&transport, Duration::from_secs(10));
    let original = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));

    registry
        .acquire("projects", vec![counting_listener("projects", &original)])
        .await
        .expect("acquire");
    registry
        .acquire("projects", vec![counting_listener("projects", &late)])
        .await
        .expect("reacquire");

    transport
        .publish(ChangeEvent::new(
            "projects",
            ChangeKind::Update,
            json!({"id": 1, "status": "funded"}),
        ))
        .expect("publish");
    for _ in 0..50 {
        if original.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(original.load(Ordering::SeqCst), 1);
    assert_eq!(late.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn release_is_idempotent() {
    let transport = LocalRealtime::new();
    let registry = registry(&transport, Duration::from_secs(10));
    let handle = registry.acquire("alerts", Vec::new()).await.unwrap();

    assert!(registry.release("alerts").await);
    assert_eq!(transport.teardowns(), 1);
    assert_eq!(handle.state(), ChannelState::Closed);
    assert_eq!(registry.state_of("alerts"), None);

    assert!(!registry.release("alerts").await);
    assert!(!registry.release("never-acquired").await);
    assert_eq!(transport.teardowns(), 1);

    registry.acquire("alerts", Vec::new()).await.unwrap();
    assert_eq!(transport.handshakes(), 2);
}

#[tokio_timeout_test(5, paused)]
async fn hung_handshake_times_out_and_is_evicted() {
    let transport = LocalRealtime::new();
    transport.set_handshake(HandshakeScript::Hang);
    let registry = registry(&transport, Duration::from_secs(10));

    let err = registry
        .acquire("payments", Vec::new())
        .await
        .expect_err("timeout");
    assert_eq!(err, AcquireError::Timeout(Duration::from_secs(10)));
    assert_eq!(registry.state_of("payments"), None);
    assert_eq!(transport.teardowns(), 1);

    transport.set_handshake(HandshakeScript::Ack);
    registry
        .acquire("payments", Vec::new())
        .await
        .expect("fresh attempt");
    assert_eq!(transport.handshakes(), 2);
}

#[tokio::test]
async fn rejected_handshake_is_evicted() {
    let transport = LocalRealtime::new();
    transport.set_handshake(HandshakeScript::Reject("not authorized".into()));
    let registry = registry(&transport, Duration::from_secs(10));

    match registry.acquire("disbursements", Vec::new()).await {
        Err(AcquireError::Handshake(reason)) => assert!(reason.contains("not authorized")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(registry.is_empty());
    assert_eq!(transport.teardowns(), 1);
}

#[tokio::test]
async fn release_all_tears_everything_down() {
    let transport = LocalRealtime::new();
    let registry = registry(&transport, Duration::from_secs(10));
    for key in ["messages", "milestones", "projects"] {
        registry.acquire(key, Vec::new()).await.unwrap();
    }
    assert_eq!(registry.keys(), vec!["messages", "milestones", "projects"]);

    assert_eq!(registry.release_all().await, 3);
    assert!(registry.is_empty());
    assert_eq!(transport.teardowns(), 3);
    assert_eq!(registry.release_all().await, 0);
}

#[tokio::test]
async fn teardown_failures_are_swallowed() {
    let transport = LocalRealtime::new();
    transport.fail_teardown(true);
    let registry = registry(&transport, Duration::from_secs(10));
    registry.acquire("alerts", Vec::new()).await.unwrap();

    assert!(registry.release("alerts").await);
    assert_eq!(registry.state_of("alerts"), None);
    assert_eq!(transport.teardowns(), 1);
}

#[tokio_timeout_test(5, paused)]
async fn release_during_handshake_discards_the_channel() {
    let transport = LocalRealtime::new();
    transport.set_handshake(HandshakeScript::AckAfter(Duration::from_secs(1)));
    let registry = registry(&transport, Duration::from_secs(10));

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.acquire("messages", Vec::new()).await }
    });
    while registry.state_of("messages").is_none() {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        registry.state_of("messages"),
        Some(ChannelState::Subscribing)
    );
    assert!(registry.release("messages").await);

    let outcome = pending.await.expect("join");
    assert_eq!(outcome.unwrap_err(), AcquireError::Released);
    assert_eq!(registry.state_of("messages"), None);
    assert_eq!(transport.handshakes(), 1);
    assert_eq!(transport.teardowns(), 1);
}
