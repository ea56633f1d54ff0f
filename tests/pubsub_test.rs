//! Multi-node pub/sub over an in-process hub, plus PostgreSQL NOTIFY

mod common;

use async_trait::async_trait;
use dbcoord::config::PubSubConfig;
use dbcoord::pubsub::{
    EventPayload, EventType, InProcessTransport, NotificationStream, NotificationTransport,
    PgNotifyTransport, PubSubManager,
};
use dbcoord::resilience::ReconnectConfig;
use dbcoord::{CoordinationError, Result};
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn recorder(bus: &PubSubManager, channel: &str) -> Arc<Mutex<Vec<EventPayload>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(channel, move |payload: EventPayload| {
        let sink = sink.clone();
        async move {
            sink.lock().push(payload);
        }
    })
    .unwrap();
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_reach_every_other_node_but_not_the_publisher() {
    let hub = InProcessTransport::default();
    let cancel = CancellationToken::new();
    let nodes: Vec<Arc<PubSubManager>> = (0..3).map(|_| common::in_process_node(&hub)).collect();
    let channel = nodes[0].config().record_changes_channel();

    let seen: Vec<_> = nodes.iter().map(|node| recorder(node, &channel)).collect();
    for node in &nodes {
        common::start_listener(node, &cancel).await;
    }

    let mut data = Map::new();
    data.insert("title".to_string(), json!("hello"));
    nodes[0]
        .publish_record_change(EventType::RecordCreate, "posts", "p1", data)
        .await
        .unwrap();

    common::wait_until(|| seen[1].lock().len() == 1 && seen[2].lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen[0].lock().is_empty());
    assert_eq!(nodes[0].stats().dispatch.self_filtered, 1);

    let received = seen[1].lock()[0].clone();
    assert_eq!(received.node_id, nodes[0].node_id());
    assert_eq!(received.event, EventType::RecordCreate);
    assert_eq!(received.record_id, "p1");
    assert_eq!(received.data["title"], json!("hello"));

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_subscription_is_picked_up_by_running_listener() {
    let hub = InProcessTransport::default();
    let cancel = CancellationToken::new();
    let publisher = common::in_process_node(&hub);
    let receiver = common::in_process_node(&hub);
    common::start_listener(&receiver, &cancel).await;

    let channel = receiver.config().collection_changes_channel();
    let seen = recorder(&receiver, &channel);
    common::wait_until(|| common::listening_on_all(&receiver)).await;

    publisher
        .publish_collection_change(EventType::CollectionUpdate, "users")
        .await
        .unwrap();
    common::wait_until(|| seen.lock().len() == 1).await;
    assert_eq!(receiver.stats().listener.connection_errors, 0);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsubscribed_handlers_stop_receiving() {
    let hub = InProcessTransport::default();
    let cancel = CancellationToken::new();
    let publisher = common::in_process_node(&hub);
    let receiver = common::in_process_node(&hub);
    let channel = receiver.config().record_changes_channel();

    let seen = Arc::new(Mutex::new(0));
    let sink = seen.clone();
    let id = receiver
        .subscribe(&channel, move |_: EventPayload| {
            let sink = sink.clone();
            async move {
                *sink.lock() += 1;
            }
        })
        .unwrap();
    let other = recorder(&receiver, &channel);
    common::start_listener(&receiver, &cancel).await;

    assert!(receiver.unsubscribe(&id));
    publisher
        .publish(&channel, EventPayload::new(EventType::RecordDelete))
        .await
        .unwrap();

    common::wait_until(|| other.lock().len() == 1).await;
    receiver.wait_for_handlers().await;
    assert_eq!(*seen.lock(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn oversized_payload_is_rejected_before_sending() {
    let hub = InProcessTransport::default();
    let bus = common::in_process_node(&hub);
    let mut probe = hub.listen(&[bus.config().record_changes_channel()]).await.unwrap();

    let mut data = Map::new();
    data.insert("blob".to_string(), json!("x".repeat(9000)));
    let err = bus
        .publish_record_change(EventType::RecordUpdate, "docs", "d1", data)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::PayloadTooLarge { limit: 7800, .. }));

    assert!(tokio::time::timeout(Duration::from_millis(50), probe.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn publish_rejects_invalid_channel_names() {
    let hub = InProcessTransport::default();
    let bus = common::in_process_node(&hub);
    let err = bus
        .publish("bad-channel", EventPayload::new(EventType::RecordCreate))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidChannel { .. }));
}

#[tokio::test]
async fn channel_prefix_is_applied() {
    let config = PubSubConfig::default().with_channels_prefix("tenant1");
    assert_eq!(config.record_changes_channel(), "tenant1_coord_record_changes");
    assert_eq!(config.hook_events_channel(), "tenant1_coord_hook_events");
}

/// Transport whose listener can never connect
#[derive(Debug, Default)]
struct UnreachableTransport {
    attempts: AtomicU32,
}

#[async_trait]
impl NotificationTransport for UnreachableTransport {
    async fn notify(&self, _channel: &str, _payload: &str) -> Result<()> {
        Ok(())
    }

    async fn listen(&self, _channels: &[String]) -> Result<Box<dyn NotificationStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CoordinationError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

#[tokio::test]
async fn listener_gives_up_after_reconnect_limit() {
    let transport = Arc::new(UnreachableTransport::default());
    let bus = PubSubManager::new(PubSubConfig::default(), Some(transport.clone()));
    bus.set_reconnect_config(ReconnectConfig {
        max_retries: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    });

    let cancel = CancellationToken::new();
    let err = tokio::time::timeout(Duration::from_secs(2), bus.start_listening(&cancel))
        .await
        .unwrap()
        .unwrap_err();

    match err {
        CoordinationError::ReconnectExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected ReconnectExhausted, got {other:?}"),
    }
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    let stats = bus.stats().listener;
    assert_eq!(stats.connection_errors, 3);
    assert!(!stats.connected);
    assert!(!bus.is_listening());
}

#[tokio::test]
async fn unlimited_reconnect_stops_on_cancel() {
    let transport = Arc::new(UnreachableTransport::default());
    let bus = Arc::new(PubSubManager::new(PubSubConfig::default(), Some(transport.clone())));
    bus.set_reconnect_config(ReconnectConfig {
        max_retries: 0,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 2.0,
    });

    let cancel = CancellationToken::new();
    let listener = {
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bus.start_listening(&cancel).await })
    };
    common::wait_until(|| transport.attempts.load(Ordering::SeqCst) >= 5).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn stop_listening_returns_cleanly() {
    let hub = InProcessTransport::default();
    let bus = common::in_process_node(&hub);
    let cancel = CancellationToken::new();
    common::start_listener(&bus, &cancel).await;

    bus.stop_listening();
    common::wait_until(|| !bus.is_listening()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn postgres_notify_crosses_nodes() {
    let backend = common::postgres_backend().await;
    let pool = backend.as_postgres().unwrap().clone();
    let config = PubSubConfig::default().with_channels_prefix("it");
    let node_a = Arc::new(PubSubManager::new(
        config.clone(),
        Some(Arc::new(PgNotifyTransport::new(pool.clone()))),
    ));
    let node_b = Arc::new(PubSubManager::new(
        config,
        Some(Arc::new(PgNotifyTransport::new(pool))),
    ));

    let channel = node_b.config().cache_invalidation_channel();
    let seen_a = recorder(&node_a, &channel);
    let seen_b = recorder(&node_b, &channel);
    let cancel = CancellationToken::new();
    common::start_listener(&node_a, &cancel).await;
    common::start_listener(&node_b, &cancel).await;

    let record = common::unique_name("rec");
    node_a
        .publish_cache_invalidation("users", &record)
        .await
        .unwrap();

    common::wait_until(|| seen_b.lock().len() == 1).await;
    assert_eq!(seen_b.lock()[0].record_id, record);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen_a.lock().is_empty());

    cancel.cancel();
}
