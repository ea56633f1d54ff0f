use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::BackendKind;

/// Row-level lock requested by a `SELECT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    None,
    ForUpdate,
    ForShare,
    ForUpdateNoWait,
    ForUpdateSkipLocked,
}

impl LockMode {
    /// PostgreSQL locking clause
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::None => "",
            Self::ForUpdate => "FOR UPDATE",
            Self::ForShare => "FOR SHARE",
            Self::ForUpdateNoWait => "FOR UPDATE NOWAIT",
            Self::ForUpdateSkipLocked => "FOR UPDATE SKIP LOCKED",
        }
    }

    /// Locking clause for `kind`; empty where the engine has no row locks.
    ///
    /// SQLite serializes every writer on the whole database, so a plain read
    /// inside a write transaction is already as strong as `FOR UPDATE`.
    pub fn clause_for(self, kind: BackendKind) -> &'static str {
        if kind.supports_row_locks() {
            self.as_sql()
        } else {
            ""
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            other => f.write_str(other.as_sql()),
        }
    }
}
