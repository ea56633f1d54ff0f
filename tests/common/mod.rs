#![allow(dead_code)]

use dbcoord::config::{DatabaseConfig, PubSubConfig};
use dbcoord::pubsub::{InProcessTransport, PubSubManager};
use dbcoord::DatabaseBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Generate a unique name for test data
pub fn unique_name(prefix: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let random: u32 = fastrand::u32(..);
    format!("{prefix}_{timestamp}_{random}")
}

/// `DATABASE_URL` if it points at PostgreSQL
pub fn postgres_url() -> Option<String> {
    std::env::var("DATABASE_URL")
        .ok()
        .filter(|url| url.starts_with("postgres://") || url.starts_with("postgresql://"))
}

pub async fn postgres_backend() -> DatabaseBackend {
    let url = postgres_url().expect("DATABASE_URL must point at PostgreSQL for ignored tests");
    DatabaseBackend::connect(&DatabaseConfig {
        url,
        max_connections: 10,
        ..DatabaseConfig::default()
    })
    .await
    .expect("connect to PostgreSQL")
}

/// Single-connection in-memory SQLite so every query sees the same database
pub async fn sqlite_backend() -> DatabaseBackend {
    DatabaseBackend::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        ..DatabaseConfig::default()
    })
    .await
    .expect("open in-memory SQLite")
}

/// A bus attached to `hub`; several of these simulate several nodes
pub fn in_process_node(hub: &InProcessTransport) -> Arc<PubSubManager> {
    Arc::new(PubSubManager::new(
        PubSubConfig::default(),
        Some(Arc::new(hub.clone())),
    ))
}

/// Spawn the bus listener and wait until it listens on every subscribed channel
pub async fn start_listener(bus: &Arc<PubSubManager>, cancel: &CancellationToken) {
    let listener = Arc::clone(bus);
    let cancel = cancel.clone();
    tokio::spawn(async move { listener.start_listening(&cancel).await });
    wait_until(|| listening_on_all(bus)).await;
}

/// Connected and LISTENing on every channel that has a subscriber
pub fn listening_on_all(bus: &PubSubManager) -> bool {
    let stats = bus.stats().listener;
    stats.connected && stats.channels_listening >= bus.subscribed_channels().len()
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// [`wait_until`] for conditions that need to await
pub async fn wait_until_async<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
