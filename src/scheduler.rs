//! # Distributed Cron Scheduler
//!
//! Guarantees at most one active executor per task across every node sharing
//! an [`AdvisoryLockManager`]. Timing is left to the caller: whatever drives
//! the schedule calls [`DistributedCronScheduler::trigger_task`] on every
//! node, and the lock decides which one runs.
//!
//! ```rust,no_run
//! use dbcoord::locks::InProcessLockManager;
//! use dbcoord::scheduler::DistributedCronScheduler;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> dbcoord::Result<()> {
//! let scheduler = DistributedCronScheduler::new(Arc::new(InProcessLockManager::new()));
//! scheduler.register_task("nightly-export", "0 2 * * *", || async {
//!     // export...
//!     Ok(())
//! });
//! scheduler
//!     .trigger_task("nightly-export", &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::constants::lock_prefixes;
use crate::error::{CoordinationError, Result};
use crate::locks::{AdvisoryLockGuard, AdvisoryLockManager};
use crate::logging::log_handler_failure;
use crate::utils::panic::catch_handler_panic;

/// Type-erased task body
pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Default)]
struct TaskState {
    running: bool,
    last_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct CronTask {
    name: String,
    schedule: String,
    handler: TaskHandler,
    state: Mutex<TaskState>,
}

impl CronTask {
    fn status(&self) -> TaskStatus {
        let state = self.state.lock();
        TaskStatus {
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            running: state.running,
            last_run: state.last_run,
            last_error: state.last_error.clone(),
        }
    }
}

/// Marks a task running on this node until finished or dropped
struct RunningTask {
    task: Arc<CronTask>,
    finished: bool,
}

impl RunningTask {
    /// `None` if a local run is already in progress
    fn enter(task: &Arc<CronTask>) -> Option<Self> {
        let mut state = task.state.lock();
        if state.running {
            return None;
        }
        state.running = true;
        Some(Self {
            task: Arc::clone(task),
            finished: false,
        })
    }

    fn finish(mut self, outcome: &Result<()>) {
        self.finished = true;
        let mut state = self.task.state.lock();
        state.running = false;
        state.last_run = Some(Utc::now());
        state.last_error = outcome.as_ref().err().map(ToString::to_string);
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(task = %self.task.name, "Cron run abandoned before completion");
        let mut state = self.task.state.lock();
        state.running = false;
        state.last_run = Some(Utc::now());
        state.last_error = Some(CoordinationError::Cancelled.to_string());
    }
}

/// Snapshot of a registered task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub name: String,
    /// Stored verbatim; interpreting it is the caller's business
    pub schedule: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Per-task leader election over advisory locks
pub struct DistributedCronScheduler {
    locks: Arc<dyn AdvisoryLockManager>,
    tasks: DashMap<String, Arc<CronTask>>,
}

impl std::fmt::Debug for DistributedCronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCronScheduler")
            .field("lock_backend", &self.locks.backend_name())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl DistributedCronScheduler {
    pub fn new(locks: Arc<dyn AdvisoryLockManager>) -> Self {
        Self {
            locks,
            tasks: DashMap::new(),
        }
    }

    /// Lock name guarding `task`
    pub fn lock_name(task: &str) -> String {
        format!("{}{task}", lock_prefixes::CRON)
    }

    /// Register (or replace) a task
    pub fn register_task<F, Fut>(&self, name: &str, schedule: &str, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move || handler().boxed());
        let task = CronTask {
            name: name.to_string(),
            schedule: schedule.to_string(),
            handler,
            state: Mutex::new(TaskState::default()),
        };
        if self.tasks.insert(name.to_string(), Arc::new(task)).is_some() {
            info!(task = %name, schedule = %schedule, "⏰ Cron task replaced");
        } else {
            info!(task = %name, schedule = %schedule, "⏰ Cron task registered");
        }
    }

    pub fn unregister_task(&self, name: &str) -> bool {
        let removed = self.tasks.remove(name).is_some();
        if removed {
            info!(task = %name, "Cron task unregistered");
        }
        removed
    }

    /// Run `name` here if no other executor holds its lock.
    ///
    /// Losing the lock race, an unknown task and a local run already in
    /// progress all return `Ok(())`. Only the handler's own failure (or
    /// panic), cancellation and backend errors from the lock attempt are
    /// surfaced. Cancelling `cancel` abandons the handler; dropping the
    /// returned future does the same. Either way the lock is released and the
    /// task is no longer marked running.
    #[instrument(skip(self, cancel), fields(lock_backend = self.locks.backend_name()))]
    pub async fn trigger_task(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(task) = self.tasks.get(name).map(|entry| Arc::clone(entry.value())) else {
            debug!(task = %name, "Trigger for unregistered task ignored");
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled);
        }

        let Some(lock) = AdvisoryLockGuard::try_acquire(&self.locks, &Self::lock_name(name)).await?
        else {
            debug!(task = %name, "Cron lock held elsewhere, skipping run");
            return Ok(());
        };

        let Some(run) = RunningTask::enter(&task) else {
            debug!(task = %name, "Task already running on this node, skipping run");
            Self::release(lock).await;
            return Ok(());
        };

        debug!(task = %name, "▶️ Running cron task");
        let handler = Arc::clone(&task.handler);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinationError::Cancelled),
            outcome = catch_handler_panic(name, async move {
                handler().await.map_err(CoordinationError::from_handler)
            }) => outcome,
        };

        run.finish(&outcome);
        Self::release(lock).await;

        if let Err(ref e) = outcome {
            log_handler_failure("cron", name, e);
        }
        outcome
    }

    async fn release(lock: AdvisoryLockGuard) {
        let lock_name = lock.name().to_string();
        if let Err(e) = lock.release().await {
            error!(lock_name = %lock_name, error = %e, "Failed to release cron lock");
        }
    }

    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.get(name).map(|entry| entry.value().status())
    }

    /// All registered tasks, sorted by name
    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        let mut tasks: Vec<TaskStatus> = self
            .tasks
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }
}
