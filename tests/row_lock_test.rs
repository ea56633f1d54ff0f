//! Row-lock primitives on SQLite (always) and PostgreSQL (ignored)

mod common;

use dbcoord::config::DatabaseConfig;
use dbcoord::row_lock::{quote_ident, LockMode, RowData, RowLocker};
use dbcoord::{BackendKind, CoordinationError, DatabaseBackend};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

async fn inventory_on(backend: DatabaseBackend, table: &str) -> RowLocker {
    let table = quote_ident(table).unwrap();
    let create = format!(
        "CREATE TABLE {table} (id TEXT PRIMARY KEY, stock BIGINT NOT NULL, sku TEXT NOT NULL)"
    );
    let insert = format!(
        "INSERT INTO {table} (id, stock, sku) VALUES ('item1', 100, 'SKU-1'), ('item2', 5, 'SKU-2')"
    );
    match &backend {
        DatabaseBackend::Postgres(pool) => {
            sqlx::query(&create).execute(pool).await.unwrap();
            sqlx::query(&insert).execute(pool).await.unwrap();
        }
        DatabaseBackend::Sqlite(pool) => {
            sqlx::query(&create).execute(pool).await.unwrap();
            sqlx::query(&insert).execute(pool).await.unwrap();
        }
    }
    RowLocker::new(backend)
}

async fn stock(locker: &RowLocker, table: &str, id: &str) -> i64 {
    let mut tx = locker.begin().await.unwrap();
    let row = tx
        .select_with_lock(table, id, LockMode::None)
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    row["stock"].as_i64().unwrap()
}

#[tokio::test]
async fn decrement_never_goes_below_floor_on_sqlite() {
    let locker = inventory_on(common::sqlite_backend().await, "inventory").await;

    assert_eq!(
        locker
            .decrement_with_lock("inventory", "item1", "stock", 50, 0)
            .await
            .unwrap(),
        50
    );

    let err = locker
        .decrement_with_lock("inventory", "item1", "stock", 100, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::LockViolation { .. }));
    assert_eq!(stock(&locker, "inventory", "item1").await, 50);
}

#[tokio::test]
async fn lock_clause_degrades_on_sqlite() {
    let locker = inventory_on(common::sqlite_backend().await, "inventory").await;
    assert_eq!(locker.kind(), BackendKind::Sqlite);
    assert_eq!(LockMode::ForUpdateNoWait.clause_for(locker.kind()), "");

    // Every mode still reads the row
    let mut tx = locker.begin().await.unwrap();
    for mode in [
        LockMode::ForUpdate,
        LockMode::ForShare,
        LockMode::ForUpdateNoWait,
        LockMode::ForUpdateSkipLocked,
    ] {
        let row = tx.select_with_lock("inventory", "item2", mode).await.unwrap();
        assert_eq!(row["sku"], json!("SKU-2"));
    }
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn update_with_lock_round_trips_on_sqlite() {
    let locker = inventory_on(common::sqlite_backend().await, "inventory").await;
    locker
        .update_with_lock("inventory", "item2", |mut row| {
            let current = row["stock"].as_i64().unwrap_or_default();
            row.insert("stock".to_string(), json!(current * 2));
            Ok(row)
        })
        .await
        .unwrap();
    assert_eq!(stock(&locker, "inventory", "item2").await, 10);

    assert_eq!(
        locker
            .increment_with_lock("inventory", "item2", "stock", 3)
            .await
            .unwrap(),
        13
    );
}

#[tokio::test]
async fn negative_increment_has_no_floor() {
    let locker = inventory_on(common::sqlite_backend().await, "inventory").await;
    assert_eq!(
        locker
            .increment_with_lock("inventory", "item2", "stock", -3)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        locker
            .increment_with_lock("inventory", "item2", "stock", -10)
            .await
            .unwrap(),
        -8
    );
    assert_eq!(stock(&locker, "inventory", "item2").await, -8);
}

/// Twenty writers against one file database with the default pool size
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_locked_updates_serialize_on_file_sqlite() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("coord.db").display());
    let backend = DatabaseBackend::connect(&DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    })
    .await
    .unwrap();
    let locker = Arc::new(inventory_on(backend, "inventory").await);

    let mut writers = Vec::new();
    for _ in 0..20 {
        let locker = locker.clone();
        writers.push(tokio::spawn(async move {
            locker
                .update_with_lock("inventory", "item2", |mut row| {
                    let current = row["stock"].as_i64().unwrap_or_default();
                    row.insert("stock".to_string(), json!(current + 1));
                    Ok(row)
                })
                .await
        }));
    }

    let mut failures = Vec::new();
    for writer in writers {
        if let Err(e) = writer.await.unwrap() {
            failures.push(e.to_string());
        }
    }
    assert!(failures.is_empty(), "locked updates failed: {failures:?}");
    assert_eq!(stock(&locker, "inventory", "item2").await, 25);
}

#[tokio::test]
async fn identifiers_are_quoted() {
    let locker = inventory_on(common::sqlite_backend().await, "odd \"name\"").await;
    let mut tx = locker.begin().await.unwrap();
    let mut filters = RowData::new();
    filters.insert("sku".to_string(), json!("SKU-1"));
    let rows = tx
        .select_for_update_skip_locked("odd \"name\"", &filters, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!("item1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn postgres_concurrent_decrements_respect_floor() {
    let table = common::unique_name("inventory");
    let locker = Arc::new(inventory_on(common::postgres_backend().await, &table).await);

    let mut workers = Vec::new();
    for _ in 0..30 {
        let locker = locker.clone();
        let table = table.clone();
        workers.push(tokio::spawn(async move {
            locker
                .decrement_with_lock(&table, "item1", "stock", 7, 0)
                .await
        }));
    }

    let mut succeeded = 0;
    for worker in workers {
        match worker.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert!(e.is_lock_violation(), "unexpected error: {e}"),
        }
    }

    // 100 / 7 = 14 decrements fit above zero
    assert_eq!(succeeded, 14);
    assert_eq!(stock(&locker, &table, "item1").await, 2);
}

#[tokio::test]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn postgres_skip_locked_skips_rows_held_elsewhere() {
    let table = common::unique_name("queue");
    let locker = inventory_on(common::postgres_backend().await, &table).await;

    let mut holder = locker.begin().await.unwrap();
    holder.select_for_update(&table, "item1").await.unwrap();

    let mut other = locker.begin().await.unwrap();
    let rows = other
        .select_for_update_skip_locked(&table, &RowData::new(), 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!("item2"));

    let err = other
        .select_with_lock(&table, "item1", LockMode::ForUpdateNoWait)
        .await
        .unwrap_err();
    assert!(dbcoord::resilience::is_lock_timeout_error(&err));

    other.rollback().await.unwrap();
    holder.rollback().await.unwrap();
}
