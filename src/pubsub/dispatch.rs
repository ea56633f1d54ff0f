//! Bounded handler execution
//!
//! Every received event fans out to handler tasks through a [`DispatchPool`]:
//! at most `max_in_flight` run at once, and the configured [`OverflowPolicy`]
//! decides whether a full pool back-pressures the caller or sheds the newest
//! invocation. Running tasks are tracked apart from the semaphore, so
//! [`DispatchPool::wait_idle`] never holds slots that new events need.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::config::{DispatchConfig, OverflowPolicy};
use crate::error::CoordinationError;
use crate::logging::log_handler_failure;
use crate::utils::panic::catch_handler_panic;

/// Dispatch counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Handler tasks started
    pub dispatched: u64,
    /// Events dropped because this node published them
    pub self_filtered: u64,
    /// Handler invocations shed by [`OverflowPolicy::DropNewest`]
    pub dropped: u64,
    /// Handler tasks that panicked
    pub panics: u64,
    /// Handler tasks that returned an error
    pub failures: u64,
    /// Handler tasks currently running
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    self_filtered: AtomicU64,
    dropped: AtomicU64,
    panics: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicU64,
    idle: Notify,
}

impl DispatchCounters {
    fn task_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Semaphore-bounded task spawner for event handlers
#[derive(Debug, Clone)]
pub struct DispatchPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    policy: OverflowPolicy,
    counters: Arc<DispatchCounters>,
}

impl DispatchPool {
    pub fn new(name: &'static str, config: &DispatchConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            policy: config.overflow_policy,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Run `task` on its own tokio task once a slot is free.
    ///
    /// Under [`OverflowPolicy::Block`] this waits for a slot; under
    /// [`OverflowPolicy::DropNewest`] a full pool discards `task` and returns
    /// `false`. Errors and panics from `task` are logged and counted, never
    /// propagated.
    pub async fn submit<F>(&self, label: String, task: F) -> bool
    where
        F: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let permit = match self.policy {
            OverflowPolicy::Block => match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            OverflowPolicy::DropNewest => match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        pool = self.name,
                        handler = %label,
                        max_in_flight = self.max_in_flight,
                        "Dispatch pool full, dropping handler invocation"
                    );
                    return false;
                }
            },
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        let counters = Arc::clone(&self.counters);
        let pool = self.name;

        tokio::spawn(async move {
            match catch_handler_panic(&label, task).await {
                Ok(()) => debug!(pool, handler = %label, "Handler completed"),
                Err(e @ CoordinationError::HandlerPanicked { .. }) => {
                    counters.panics.fetch_add(1, Ordering::Relaxed);
                    log_handler_failure(pool, &label, &e);
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    log_handler_failure(pool, &label, &e);
                }
            }
            drop(permit);
            counters.task_finished();
        });

        true
    }

    pub(crate) fn record_self_filtered(&self) {
        self.counters.self_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait until no handler task is running.
    ///
    /// Takes no slots, so submissions made meanwhile are accepted as usual.
    /// Under a steady stream of events this may keep waiting.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            self_filtered: self.counters.self_filtered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            panics: self.counters.panics.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
        }
    }
}
