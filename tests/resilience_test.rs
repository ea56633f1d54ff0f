//! Conflict-retry behaviour as seen by callers outside the crate

use dbcoord::resilience::{
    classify_message, is_deadlock_error, is_retryable_error, retry_with_backoff, ErrorClass,
    RetryConfig, RetryError,
};
use dbcoord::CoordinationError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn quick(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

fn connection_reset() -> CoordinationError {
    CoordinationError::Database(sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    )))
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let value = retry_with_backoff(&quick(3), &CancellationToken::new(), move |attempt| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if attempt < 3 {
                Err(connection_reset())
            } else {
                Ok("flushed")
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, "flushed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_error_is_returned_unchanged() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let err = retry_with_backoff(&quick(5), &CancellationToken::new(), move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CoordinationError::invalid_argument("bad column"))
        }
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err.into_inner(),
        Some(CoordinationError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn exhausted_retries_return_the_last_error() {
    let err = retry_with_backoff(&quick(2), &CancellationToken::new(), |_| async {
        Err::<(), _>(connection_reset())
    })
    .await
    .unwrap_err();

    let inner = err.into_inner().unwrap();
    assert!(is_retryable_error(&inner));
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let config = RetryConfig {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
        ..quick(10)
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = retry_with_backoff(&config, &cancel, |_| async {
        Err::<(), _>(connection_reset())
    })
    .await
    .unwrap_err();

    assert!(matches!(err, RetryError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        CoordinationError::from(err),
        CoordinationError::Cancelled
    ));
}

#[test]
fn messages_from_both_engines_are_classified() {
    assert_eq!(
        classify_message("ERROR: deadlock detected"),
        ErrorClass::Deadlock
    );
    assert_eq!(
        classify_message("database is locked"),
        ErrorClass::EngineBusy
    );
    assert_eq!(
        classify_message("could not serialize access due to concurrent update"),
        ErrorClass::SerializationFailure
    );
    assert_eq!(
        classify_message("duplicate key value violates unique constraint"),
        ErrorClass::Permanent
    );

    let marked = CoordinationError::retryable("try again");
    assert!(is_retryable_error(&marked));
    assert!(!is_deadlock_error(&marked));

    let marked_deadlock = CoordinationError::retryable("deadlock detected");
    assert!(is_deadlock_error(&marked_deadlock));
}
