//! # Pessimistic Row Locks
//!
//! `SELECT ... FOR UPDATE` style helpers and locked read-modify-write
//! operations. On PostgreSQL the requested [`LockMode`] is applied. SQLite has
//! no row locks, so the same calls become plain reads inside a transaction and
//! rely on the engine's single-writer serialization.

pub mod mode;
pub mod primitives;

pub use mode::LockMode;
pub use primitives::{quote_ident, LockTransaction, RowData, RowLocker};
