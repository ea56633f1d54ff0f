//! Cache invalidation between two nodes sharing one coordination domain

mod common;

use dbcoord::bootstrap::CoordinationSystem;
use dbcoord::config::CoordinationConfig;
use dbcoord::pubsub::InProcessTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

async fn node(hub: &InProcessTransport) -> CoordinationSystem {
    let system = CoordinationSystem::with_transport(
        common::sqlite_backend().await,
        CoordinationConfig::default(),
        Some(Arc::new(hub.clone())),
    );
    system.start();
    system
}

/// Wait until the cache and hook receivers are subscribed and LISTENing
async fn ready(system: &CoordinationSystem) {
    let bus = system.pubsub().clone();
    common::wait_until(|| {
        bus.subscribed_channels().len() == 2 && common::listening_on_all(&bus)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalidating_a_user_clears_the_other_nodes_cache() {
    let hub = InProcessTransport::default();
    let node_a = node(&hub).await;
    let node_b = node(&hub).await;

    let cleared_a = Arc::new(Mutex::new(Vec::<String>::new()));
    let cleared_b = Arc::new(Mutex::new(Vec::<String>::new()));
    for (system, sink) in [(&node_a, &cleared_a), (&node_b, &cleared_b)] {
        let sink = sink.clone();
        system.cache().on_invalidate("users", move |record_id| {
            let sink = sink.clone();
            async move {
                sink.lock().push(record_id);
                Ok(())
            }
        });
    }
    ready(&node_a).await;
    ready(&node_b).await;

    node_a.cache().invalidate_record("users", "123").await.unwrap();

    common::wait_until(|| cleared_b.lock().len() == 1).await;
    assert_eq!(*cleared_b.lock(), vec!["123".to_string()]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cleared_a.lock().is_empty());

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collection_wide_and_global_invalidation() {
    let hub = InProcessTransport::default();
    let node_a = node(&hub).await;
    let node_b = node(&hub).await;

    let global = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let global = global.clone();
        node_b.cache().on_invalidate_all(move |collection, record_id| {
            let global = global.clone();
            async move {
                global.lock().push(format!("{collection}/{record_id}"));
                Ok(())
            }
        });
    }
    ready(&node_a).await;
    ready(&node_b).await;

    node_a.cache().invalidate_collection("posts").await.unwrap();
    node_a
        .cache()
        .invalidate_records("tags", &["t1", "t2"])
        .await
        .unwrap();

    common::wait_until(|| global.lock().len() == 3).await;
    let mut seen = global.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["posts/*", "tags/t1", "tags/t2"]);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn sqlite_only_node_publishes_nowhere() {
    let system = CoordinationSystem::from_backend(
        common::sqlite_backend().await,
        CoordinationConfig::default(),
    );
    assert!(system.pubsub().is_mock());
    system.cache().invalidate_record("users", "1").await.unwrap();
}
