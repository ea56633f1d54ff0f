//! Panic containment for user-supplied handlers.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::error::{CoordinationError, Result};

/// Drive `future`, turning a panic inside it into [`CoordinationError::HandlerPanicked`]
pub async fn catch_handler_panic<F, T>(name: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(CoordinationError::HandlerPanicked {
            name: name.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
