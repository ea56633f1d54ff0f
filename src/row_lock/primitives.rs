//! Locked reads and read-modify-write helpers over either backend.
//!
//! Rows travel as JSON objects keyed by column name. Every table is expected
//! to carry a text primary key column named `id`.

use serde_json::{Map, Number, Value};
use sqlx::postgres::Postgres;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::types::Json;
use sqlx::{Column, QueryBuilder, Row, Transaction, TypeInfo, ValueRef};
use tracing::{debug, instrument, warn};

use super::mode::LockMode;
use crate::database::{BackendKind, DatabaseBackend};
use crate::error::{CoordinationError, Result};

const SQLITE_BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// A row as a JSON object keyed by column name
pub type RowData = Map<String, Value>;

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> Result<String> {
    if ident.is_empty() {
        return Err(CoordinationError::invalid_argument(
            "identifier must not be empty",
        ));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

fn quoted_columns(fields: &RowData) -> Result<Vec<(String, &Value)>> {
    fields
        .iter()
        .map(|(column, value)| Ok((quote_ident(column)?, value)))
        .collect()
}

macro_rules! push_json_bind {
    ($builder:expr, $value:expr) => {
        match $value {
            Value::Bool(flag) => {
                $builder.push_bind(*flag);
            }
            Value::Number(number) => match number.as_i64() {
                Some(int) => {
                    $builder.push_bind(int);
                }
                None => {
                    $builder.push_bind(number.as_f64().unwrap_or_default());
                }
            },
            Value::String(text) => {
                $builder.push_bind(text.clone());
            }
            other => {
                $builder.push_bind(Json(other.clone()));
            }
        }
    };
}

macro_rules! push_filters {
    ($builder:expr, $filters:expr) => {
        for (position, (column, value)) in $filters.iter().enumerate() {
            $builder.push(if position == 0 { " WHERE " } else { " AND " });
            $builder.push(column.as_str());
            if value.is_null() {
                $builder.push(" IS NULL");
            } else {
                $builder.push(" = ");
                push_json_bind!($builder, *value);
            }
        }
    };
}

macro_rules! push_assignments {
    ($builder:expr, $fields:expr) => {
        for (position, (column, value)) in $fields.iter().enumerate() {
            if position > 0 {
                $builder.push(", ");
            }
            $builder.push(column.as_str());
            $builder.push(" = ");
            if value.is_null() {
                $builder.push("NULL");
            } else {
                push_json_bind!($builder, *value);
            }
        }
    };
}

fn json_object(value: Value) -> Result<RowData> {
    Ok(serde_json::from_value(value)?)
}

/// Decode a SQLite row by the storage class of each value
fn sqlite_row_to_json(row: &SqliteRow) -> Result<RowData> {
    let mut data = Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
                    .map_or(Value::Null, Value::Number),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get_unchecked(index)?;
                    Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
                }
                _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        data.insert(column.name().to_string(), value);
    }
    Ok(data)
}

enum TxInner {
    Postgres(Transaction<'static, Postgres>),
    Sqlite(Transaction<'static, Sqlite>),
}

/// An open transaction for locked reads and writes.
///
/// Dropping it without [`Self::commit`] rolls back.
pub struct LockTransaction {
    inner: TxInner,
}

impl std::fmt::Debug for LockTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTransaction")
            .field("backend", &self.kind())
            .finish()
    }
}

impl LockTransaction {
    pub fn kind(&self) -> BackendKind {
        match self.inner {
            TxInner::Postgres(_) => BackendKind::Postgres,
            TxInner::Sqlite(_) => BackendKind::Sqlite,
        }
    }

    pub async fn select_for_update(&mut self, table: &str, id: &str) -> Result<RowData> {
        self.select_with_lock(table, id, LockMode::ForUpdate).await
    }

    /// Read one row by id, locked with `mode` where the backend supports it
    pub async fn select_with_lock(
        &mut self,
        table: &str,
        id: &str,
        mode: LockMode,
    ) -> Result<RowData> {
        let table_sql = quote_ident(table)?;
        let clause = mode.clause_for(self.kind());

        let row = match &mut self.inner {
            TxInner::Postgres(tx) => {
                let sql = format!("SELECT to_jsonb(t) FROM {table_sql} t WHERE t.\"id\" = $1 {clause}");
                match sqlx::query_scalar::<_, Value>(&sql)
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?
                {
                    Some(value) => Some(json_object(value)?),
                    None => None,
                }
            }
            TxInner::Sqlite(tx) => {
                let sql = format!("SELECT * FROM {table_sql} WHERE \"id\" = ?1 {clause}");
                match sqlx::query(&sql).bind(id).fetch_optional(&mut **tx).await? {
                    Some(row) => Some(sqlite_row_to_json(&row)?),
                    None => None,
                }
            }
        };

        row.ok_or_else(|| CoordinationError::row_not_found(table, id))
    }

    /// Rows matching every `filters` equality (JSON null matches `IS NULL`),
    /// skipping rows other transactions have locked. `limit <= 0` means no
    /// limit.
    pub async fn select_for_update_skip_locked(
        &mut self,
        table: &str,
        filters: &RowData,
        limit: i64,
    ) -> Result<Vec<RowData>> {
        let table_sql = quote_ident(table)?;
        let filters = quoted_columns(filters)?;
        let clause = LockMode::ForUpdateSkipLocked.clause_for(self.kind());

        match &mut self.inner {
            TxInner::Postgres(tx) => {
                let mut builder =
                    QueryBuilder::<Postgres>::new(format!("SELECT to_jsonb(t) FROM {table_sql} t"));
                push_filters!(builder, filters);
                if limit > 0 {
                    builder.push(" LIMIT ");
                    builder.push_bind(limit);
                }
                builder.push(" ");
                builder.push(clause);

                let rows: Vec<Value> = builder
                    .build_query_scalar()
                    .fetch_all(&mut **tx)
                    .await?;
                rows.into_iter().map(json_object).collect()
            }
            TxInner::Sqlite(tx) => {
                let mut builder =
                    QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {table_sql}"));
                push_filters!(builder, filters);
                if limit > 0 {
                    builder.push(" LIMIT ");
                    builder.push_bind(limit);
                }

                let rows = builder.build().fetch_all(&mut **tx).await?;
                rows.iter().map(sqlite_row_to_json).collect()
            }
        }
    }

    /// Write `fields` (never `id`) to one row
    pub async fn update_fields(&mut self, table: &str, id: &str, fields: &RowData) -> Result<()> {
        let table_sql = quote_ident(table)?;
        let mut writable = RowData::new();
        for (column, value) in fields {
            if column != "id" {
                writable.insert(column.clone(), value.clone());
            }
        }
        if writable.is_empty() {
            return Err(CoordinationError::invalid_argument(
                "update requires at least one field besides id",
            ));
        }
        let assignments = quoted_columns(&writable)?;

        let affected = match &mut self.inner {
            TxInner::Postgres(tx) => {
                let mut builder = QueryBuilder::<Postgres>::new(format!("UPDATE {table_sql} SET "));
                push_assignments!(builder, assignments);
                builder.push(" WHERE \"id\" = ");
                builder.push_bind(id.to_string());
                builder.build().execute(&mut **tx).await?.rows_affected()
            }
            TxInner::Sqlite(tx) => {
                let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {table_sql} SET "));
                push_assignments!(builder, assignments);
                builder.push(" WHERE \"id\" = ");
                builder.push_bind(id.to_string());
                builder.build().execute(&mut **tx).await?.rows_affected()
            }
        };

        if affected == 0 {
            return Err(CoordinationError::row_not_found(table, id));
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        match self.inner {
            TxInner::Postgres(tx) => tx.commit().await?,
            TxInner::Sqlite(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        match self.inner {
            TxInner::Postgres(tx) => tx.rollback().await?,
            TxInner::Sqlite(tx) => tx.rollback().await?,
        }
        Ok(())
    }

    async fn add_to_field(&mut self, table: &str, id: &str, field: &str, delta: i64) -> Result<i64> {
        let table_sql = quote_ident(table)?;
        let field_sql = quote_ident(field)?;

        let updated = match &mut self.inner {
            TxInner::Postgres(tx) => {
                let sql = format!(
                    "UPDATE {table_sql} SET {field_sql} = {field_sql} + $1 WHERE \"id\" = $2 RETURNING {field_sql}::int8"
                );
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(delta)
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?
            }
            TxInner::Sqlite(tx) => {
                let sql = format!(
                    "UPDATE {table_sql} SET {field_sql} = {field_sql} + ?1 WHERE \"id\" = ?2 RETURNING {field_sql}"
                );
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(delta)
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?
            }
        };

        updated.ok_or_else(|| CoordinationError::row_not_found(table, id))
    }

    async fn subtract_with_floor(
        &mut self,
        table: &str,
        id: &str,
        field: &str,
        delta: i64,
        min_value: i64,
    ) -> Result<i64> {
        let table_sql = quote_ident(table)?;
        let field_sql = quote_ident(field)?;

        match &mut self.inner {
            TxInner::Postgres(tx) => {
                let lock_sql = format!(
                    "SELECT {field_sql}::int8 FROM {table_sql} WHERE \"id\" = $1 FOR UPDATE"
                );
                let current = sqlx::query_scalar::<_, i64>(&lock_sql)
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?
                    .ok_or_else(|| CoordinationError::row_not_found(table, id))?;

                if current.saturating_sub(delta) < min_value {
                    return Err(CoordinationError::lock_violation(
                        "decrement",
                        format!(
                            "value would be below minimum: current={current}, delta={delta}, min={min_value}"
                        ),
                    ));
                }

                let update_sql = format!(
                    "UPDATE {table_sql} SET {field_sql} = {field_sql} - $1 WHERE \"id\" = $2 RETURNING {field_sql}::int8"
                );
                Ok(sqlx::query_scalar::<_, i64>(&update_sql)
                    .bind(delta)
                    .bind(id)
                    .fetch_one(&mut **tx)
                    .await?)
            }
            TxInner::Sqlite(tx) => {
                let update_sql = format!(
                    "UPDATE {table_sql} SET {field_sql} = {field_sql} - ?1 \
                     WHERE \"id\" = ?2 AND {field_sql} - ?1 >= ?3 RETURNING {field_sql}"
                );
                let updated = sqlx::query_scalar::<_, i64>(&update_sql)
                    .bind(delta)
                    .bind(id)
                    .bind(min_value)
                    .fetch_optional(&mut **tx)
                    .await?;
                if let Some(value) = updated {
                    return Ok(value);
                }

                // Zero rows: either the row is missing or the floor refused it
                let exists_sql = format!("SELECT COUNT(*) FROM {table_sql} WHERE \"id\" = ?1");
                let count = sqlx::query_scalar::<_, i64>(&exists_sql)
                    .bind(id)
                    .fetch_one(&mut **tx)
                    .await?;
                if count == 0 {
                    Err(CoordinationError::row_not_found(table, id))
                } else {
                    Err(CoordinationError::lock_violation(
                        "decrement",
                        format!("value would be below minimum {min_value}"),
                    ))
                }
            }
        }
    }
}

/// Entry point for row-lock operations on a backend
#[derive(Debug, Clone)]
pub struct RowLocker {
    backend: DatabaseBackend,
}

impl RowLocker {
    pub fn new(backend: DatabaseBackend) -> Self {
        Self { backend }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Open a lock transaction.
    ///
    /// On SQLite the transaction takes the database write lock up front, so
    /// concurrent read-modify-write callers queue on the busy timeout instead
    /// of failing when a shared read lock cannot be upgraded.
    pub async fn begin(&self) -> Result<LockTransaction> {
        let inner = match &self.backend {
            DatabaseBackend::Postgres(pool) => TxInner::Postgres(pool.begin().await?),
            DatabaseBackend::Sqlite(pool) => {
                TxInner::Sqlite(pool.begin_with(SQLITE_BEGIN_WRITE).await?)
            }
        };
        Ok(LockTransaction { inner })
    }

    /// Commit on success, roll back on failure and return the original error
    async fn finish<T>(tx: LockTransaction, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "Rollback after failed locked operation failed");
                }
                Err(e)
            }
        }
    }

    /// Lock a row, hand it to `transform`, write back changed columns, commit.
    ///
    /// Returns the row as produced by `transform`. An error from `transform`
    /// rolls the transaction back.
    #[instrument(skip(self, transform), fields(backend = %self.kind()))]
    pub async fn update_with_lock<F>(&self, table: &str, id: &str, transform: F) -> Result<RowData>
    where
        F: FnOnce(RowData) -> Result<RowData> + Send,
    {
        let mut tx = self.begin().await?;
        let outcome = Self::locked_update(&mut tx, table, id, transform).await;
        Self::finish(tx, outcome).await
    }

    async fn locked_update<F>(
        tx: &mut LockTransaction,
        table: &str,
        id: &str,
        transform: F,
    ) -> Result<RowData>
    where
        F: FnOnce(RowData) -> Result<RowData> + Send,
    {
        let current = tx.select_for_update(table, id).await?;
        let updated = transform(current.clone())?;

        let changes: RowData = updated
            .iter()
            .filter(|(column, value)| column.as_str() != "id" && current.get(*column) != Some(*value))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();

        if changes.is_empty() {
            debug!(table = %table, id = %id, "Locked update produced no changes");
        } else {
            tx.update_fields(table, id, &changes).await?;
        }
        Ok(updated)
    }

    /// Atomically add `delta` to an integer column, returning the new value.
    ///
    /// `delta` may be negative; no floor applies. Use
    /// [`decrement_with_lock`](Self::decrement_with_lock) for a guarded decrement.
    #[instrument(skip(self), fields(backend = %self.kind()))]
    pub async fn increment_with_lock(
        &self,
        table: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64> {
        let mut tx = self.begin().await?;
        let outcome = tx.add_to_field(table, id, field, delta).await;
        Self::finish(tx, outcome).await
    }

    /// Atomically subtract `delta` unless the result would fall below
    /// `min_value`.
    ///
    /// A refused decrement is a [`CoordinationError::LockViolation`] and leaves
    /// the stored value untouched; it is never clamped to the floor.
    #[instrument(skip(self), fields(backend = %self.kind()))]
    pub async fn decrement_with_lock(
        &self,
        table: &str,
        id: &str,
        field: &str,
        delta: i64,
        min_value: i64,
    ) -> Result<i64> {
        ensure_non_negative(delta)?;
        let mut tx = self.begin().await?;
        let outcome = tx
            .subtract_with_floor(table, id, field, delta, min_value)
            .await;
        Self::finish(tx, outcome).await
    }
}

fn ensure_non_negative(delta: i64) -> Result<()> {
    if delta < 0 {
        return Err(CoordinationError::invalid_argument(format!(
            "delta must be non-negative, got {delta}"
        )));
    }
    Ok(())
}
