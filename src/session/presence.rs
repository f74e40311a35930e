//! Presence Tracking
//!
//! Last-write-wins record of who is in a session and what they are doing.
//! Presence is advisory: it never gates action admission, it only feeds the
//! indicators other clients render (online, away, "moving tok3", cursor
//! positions). Stale entries are overwritten by the next update or replaced
//! by a synthesized "disconnected" record when the liveness sweep gives up
//! on a user.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::ids::{SessionId, UserId};

/// Presence status synthesized by the server when a user times out or
/// cleanly disconnects. Clients are free to use any other status string.
pub const STATUS_DISCONNECTED: &str = "disconnected";

/// Default status assumed when an update carries none.
pub const STATUS_ONLINE: &str = "online";

/// One user's advertised presence within one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    /// User this record describes.
    pub user_id: UserId,
    /// Session the record belongs to.
    pub session_id: SessionId,
    /// Free-form status string ("online", "away", "moving tok3", ...).
    pub status: String,
    /// Server receive time of the newest update.
    pub last_activity_at: DateTime<Utc>,
    /// Client-supplied extras (cursor position, selected resource, ...)
    /// relayed verbatim.
    pub metadata: serde_json::Value,
}

/// Per-session presence map, keyed by user. Newest update wins.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: BTreeMap<UserId, UserPresence>,
}

impl PresenceTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update for `user_id`, replacing any previous state.
    ///
    /// Returns the stored record so the caller can broadcast it.
    pub fn update(
        &mut self,
        user_id: &str,
        session_id: &str,
        status: impl Into<String>,
        metadata: serde_json::Value,
    ) -> UserPresence {
        let presence = UserPresence {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            status: status.into(),
            last_activity_at: Utc::now(),
            metadata,
        };
        self.users.insert(user_id.to_string(), presence.clone());
        presence
    }

    /// Mark `user_id` as disconnected, keeping the record so late joiners
    /// can see who was here. Returns the record, or `None` if the user was
    /// never present.
    pub fn mark_disconnected(&mut self, user_id: &str) -> Option<UserPresence> {
        let entry = self.users.get_mut(user_id)?;
        entry.status = STATUS_DISCONNECTED.to_string();
        entry.last_activity_at = Utc::now();
        Some(entry.clone())
    }

    /// Current record for `user_id`.
    pub fn get(&self, user_id: &str) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    /// Remove `user_id` entirely.
    pub fn remove(&mut self, user_id: &str) -> Option<UserPresence> {
        self.users.remove(user_id)
    }

    /// All records, ordered by user id.
    pub fn all(&self) -> Vec<UserPresence> {
        self.users.values().cloned().collect()
    }

    /// Number of tracked users (including disconnected ones).
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether nobody has ever been tracked.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
