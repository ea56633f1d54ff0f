//! # Cache Invalidation
//!
//! Keeps per-node caches coherent: a node that changes data publishes an
//! invalidation, every other node runs its registered handlers.

pub mod invalidator;

pub use invalidator::{CacheInvalidator, InvalidateAllHandler, InvalidateHandler};
