//! Conflict Resolution
//!
//! Per-resource exclusive locks with a first-wins policy. A lock is held only
//! for the span of one action's validation and apply, never across await
//! points owned by the client, so contention windows are short and there is
//! nothing to deadlock on: an action touches at most one resource.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::ids::{ResourceId, UserId};

/// An exclusive hold on one resource while an action is in flight.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    /// Locked resource.
    pub resource_id: ResourceId,
    /// User whose action holds the lock.
    pub holder: UserId,
    /// When the lock was granted.
    pub acquired_at: Instant,
}

/// All locks currently held within one session.
///
/// Not thread-safe on its own; the session guard serializes access.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<ResourceId, ResourceLock>,
}

impl LockTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire `resource_id` for `user_id`.
    ///
    /// First wins: if the resource is already held (even by the same user's
    /// earlier action) the attempt fails and the current holder is returned.
    pub fn acquire(&mut self, resource_id: &str, user_id: &str) -> Result<(), ResourceLock> {
        if let Some(existing) = self.locks.get(resource_id) {
            return Err(existing.clone());
        }
        self.locks.insert(
            resource_id.to_string(),
            ResourceLock {
                resource_id: resource_id.to_string(),
                holder: user_id.to_string(),
                acquired_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Release `resource_id` if `user_id` holds it. Returns the released
    /// lock, or `None` when the resource is unheld or held by someone else.
    pub fn release(&mut self, resource_id: &str, user_id: &str) -> Option<ResourceLock> {
        if self.locks.get(resource_id)?.holder != user_id {
            return None;
        }
        self.locks.remove(resource_id)
    }

    /// Current holder of `resource_id`, if locked.
    pub fn holder(&self, resource_id: &str) -> Option<&UserId> {
        self.locks.get(resource_id).map(|l| &l.holder)
    }

    /// Whether `resource_id` is currently locked.
    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.locks.contains_key(resource_id)
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no locks are held.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every lock. Used when a session is torn down mid-flight.
    pub fn clear(&mut self) {
        self.locks.clear();
    }
}
