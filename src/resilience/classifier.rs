//! # Transient Error Classification
//!
//! Decides whether a backend error is worth retrying. Classification walks the
//! error's source chain and checks, in order: the retryable marker variant,
//! SQLSTATE codes on `sqlx` database errors, `sqlx` connection-level variants,
//! and finally lower-cased message signatures (so wrapped or stringified
//! errors from other layers classify the same way).

use std::error::Error as StdError;

use crate::error::CoordinationError;

/// PostgreSQL SQLSTATE codes for transaction-class conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgErrorCode;

impl PgErrorCode {
    /// Serialization failure - Code 40001
    ///
    /// Raised under SERIALIZABLE/REPEATABLE READ when a transaction cannot be
    /// serialized with concurrent ones.
    pub const SERIALIZATION_FAILURE: &'static str = "40001";

    /// Deadlock detected - Code 40P01
    pub const DEADLOCK_DETECTED: &'static str = "40P01";

    /// Lock not available - Code 55P03
    ///
    /// Raised by `NOWAIT` and by `lock_timeout` expiry.
    pub const LOCK_NOT_AVAILABLE: &'static str = "55P03";

    /// Unique violation - Code 23505 (permanent)
    pub const UNIQUE_VIOLATION: &'static str = "23505";

    /// Map a SQLSTATE code onto a transient class
    pub fn classify(code: &str) -> Option<ErrorClass> {
        if code.eq_ignore_ascii_case(Self::DEADLOCK_DETECTED) {
            Some(ErrorClass::Deadlock)
        } else if code == Self::SERIALIZATION_FAILURE {
            Some(ErrorClass::SerializationFailure)
        } else if code.eq_ignore_ascii_case(Self::LOCK_NOT_AVAILABLE) {
            Some(ErrorClass::LockTimeout)
        } else {
            None
        }
    }
}

/// Classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Two transactions waited on each other; restart the whole transaction
    Deadlock,
    /// Serializable isolation conflict
    SerializationFailure,
    /// Row/advisory lock could not be obtained in time
    LockTimeout,
    /// Embedded engine single-writer contention ("database is locked")
    EngineBusy,
    /// Connection dropped, reset or refused
    Connection,
    /// Handler explicitly asked to be retried
    Marked,
    /// Never retried
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

const ENGINE_BUSY_SIGNATURES: &[&str] = &[
    "database is locked",
    "database table is locked",
    "table is locked",
    "sqlite_busy",
    "sqlite_locked",
];

const DEADLOCK_SIGNATURES: &[&str] = &["deadlock"];

const SERIALIZATION_SIGNATURES: &[&str] = &[
    "could not serialize access",
    "serialization failure",
];

const LOCK_TIMEOUT_SIGNATURES: &[&str] = &[
    "lock not available",
    "could not obtain lock",
    "lock timeout",
];

const CONNECTION_SIGNATURES: &[&str] = &[
    "connection reset",
    "connection closed",
    "connection refused",
    "broken pipe",
];

/// Classify a bare error message
pub fn classify_message(message: &str) -> ErrorClass {
    let text = message.to_lowercase();
    let contains_any = |signatures: &[&str]| signatures.iter().any(|s| text.contains(s));

    if contains_any(ENGINE_BUSY_SIGNATURES) {
        return ErrorClass::EngineBusy;
    }
    if contains_any(DEADLOCK_SIGNATURES) {
        return ErrorClass::Deadlock;
    }
    if contains_any(SERIALIZATION_SIGNATURES) {
        return ErrorClass::SerializationFailure;
    }
    if contains_any(LOCK_TIMEOUT_SIGNATURES) {
        return ErrorClass::LockTimeout;
    }
    if contains_any(CONNECTION_SIGNATURES) {
        return ErrorClass::Connection;
    }

    // SQLSTATE codes embedded in text, matched as whole tokens only
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(PgErrorCode::classify)
        .unwrap_or(ErrorClass::Permanent)
}

fn classify_sqlx(err: &sqlx::Error) -> Option<ErrorClass> {
    match err {
        sqlx::Error::Database(db) => db.code().and_then(|code| PgErrorCode::classify(&code)),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => Some(ErrorClass::Connection),
        _ => None,
    }
}

/// Concrete signatures beat the retryable marker, which only upgrades an
/// otherwise permanent error
fn classify_single(err: &(dyn StdError + 'static)) -> ErrorClass {
    if let Some(class) = err.downcast_ref::<sqlx::Error>().and_then(classify_sqlx) {
        return class;
    }
    match classify_message(&err.to_string()) {
        ErrorClass::Permanent => match err.downcast_ref::<CoordinationError>() {
            Some(coordination) if coordination.is_retryable_marker() => ErrorClass::Marked,
            _ => ErrorClass::Permanent,
        },
        class => class,
    }
}

/// Classify an error by walking its source chain; the first transient hit wins
pub fn classify_error(err: &(dyn StdError + 'static)) -> ErrorClass {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let class = classify_single(e);
        if class.is_retryable() {
            return class;
        }
        current = e.source();
    }
    ErrorClass::Permanent
}

/// Whether `err` is a transient backend error worth retrying
pub fn is_retryable_error(err: &(dyn StdError + 'static)) -> bool {
    classify_error(err).is_retryable()
}

/// Result-shaped convenience: `Ok` is never retryable
pub fn is_retryable_result<T, E>(result: &std::result::Result<T, E>) -> bool
where
    E: StdError + 'static,
{
    match result {
        Ok(_) => false,
        Err(e) => is_retryable_error(e),
    }
}

/// Only deadlocks warrant a full transaction restart
pub fn is_deadlock_error(err: &(dyn StdError + 'static)) -> bool {
    classify_error(err) == ErrorClass::Deadlock
}

pub fn is_serialization_error(err: &(dyn StdError + 'static)) -> bool {
    classify_error(err) == ErrorClass::SerializationFailure
}

pub fn is_lock_timeout_error(err: &(dyn StdError + 'static)) -> bool {
    classify_error(err) == ErrorClass::LockTimeout
}
