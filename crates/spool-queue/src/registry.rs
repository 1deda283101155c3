//! Lookup of sibling queues for expired-item hand-off.

use std::sync::Arc;

use crate::queue::PersistentQueue;

/// Resolves queue names to live queue instances.
///
/// A queue holds its registry weakly and re-resolves the `move_expired_to`
/// target on every hand-off, so the registry is free to create and drop
/// queues at any time.
pub trait QueueRegistry: Send + Sync {
    /// Looks up a queue by name.
    fn queue_by_name(&self, name: &str) -> Option<Arc<PersistentQueue>>;
}
