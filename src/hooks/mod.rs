//! # Distributed Hooks
//!
//! Named application hooks with fleet-wide execution modes. See
//! [`DistributedHookManager`].

pub mod manager;

pub use crate::pubsub::{HookMode, HookPayload};
pub use manager::{DistributedHookManager, HookHandler, HookStatus};
