//! Versioned Session State
//!
//! Tracks the authoritative version counter, the rolling state checksum, and
//! the bounded replay buffer of recently accepted actions. The buffer lets a
//! lagging client catch up by replaying only the actions it missed; once the
//! gap outgrows the buffer the client must take a full resync instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::core::checksum::{encode_checksum, Checksum, ChecksumBuilder, EMPTY_CHECKSUM};
use crate::core::ids::UserId;
use crate::session::action::{RejectReason, SessionAction};

/// Rejections kept for diagnostics, capped like the replay buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedAction {
    /// Id of the rejected action.
    pub action_id: String,
    /// Who submitted it.
    pub user_id: UserId,
    /// Why it was refused.
    pub reason: RejectReason,
    /// When the rejection happened (server clock).
    pub at: DateTime<Utc>,
}

// =============================================================================
// REPLAY BUFFER
// =============================================================================

/// Bounded FIFO of accepted actions, oldest evicted first.
#[derive(Debug)]
pub struct ReplayBuffer {
    actions: VecDeque<SessionAction>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create an empty buffer holding at most `capacity` actions.
    pub fn new(capacity: usize) -> Self {
        Self {
            actions: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append an accepted action, evicting the oldest entry when full.
    pub fn push(&mut self, action: SessionAction) {
        if self.actions.len() == self.capacity {
            self.actions.pop_front();
        }
        self.actions.push_back(action);
    }

    /// Number of buffered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Version of the oldest buffered action, if any.
    pub fn oldest_version(&self) -> Option<u64> {
        self.actions.front().map(|a| a.version)
    }

    /// All buffered actions with version strictly greater than `version`,
    /// oldest first.
    pub fn since(&self, version: u64) -> Vec<SessionAction> {
        self.actions
            .iter()
            .filter(|a| a.version > version)
            .cloned()
            .collect()
    }
}

// =============================================================================
// SYNC STATE
// =============================================================================

/// How a lagging client should catch up.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayPlan {
    /// Client already holds the current version.
    UpToDate,
    /// Replay these actions in order to reach the current version.
    Actions(Vec<SessionAction>),
    /// Gap exceeds the buffer; the client must refetch the full document.
    FullResync,
}

/// Authoritative version counter, checksum chain, and replay buffer for one
/// session.
///
/// The checksum is a rolling digest chained over every accepted action, so
/// two replicas that admitted the same actions in the same order agree on it
/// without comparing documents.
#[derive(Debug)]
pub struct SyncState {
    version: u64,
    checksum: Checksum,
    last_sync_at: DateTime<Utc>,
    pending: ReplayBuffer,
    conflicted: VecDeque<ConflictedAction>,
    conflict_capacity: usize,
}

impl SyncState {
    /// Fresh state at version 0 with an empty checksum.
    pub fn new(replay_capacity: usize, conflict_capacity: usize) -> Self {
        Self {
            version: 0,
            checksum: EMPTY_CHECKSUM,
            last_sync_at: Utc::now(),
            pending: ReplayBuffer::new(replay_capacity),
            conflicted: VecDeque::new(),
            conflict_capacity: conflict_capacity.max(1),
        }
    }

    /// Current version. Starts at 0, increments by exactly 1 per accepted
    /// action, never goes backwards.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Current rolling checksum.
    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Hex form of the current checksum, as sent on the wire.
    pub fn checksum_hex(&self) -> String {
        encode_checksum(&self.checksum)
    }

    /// When the last action was accepted (or the state created).
    pub fn last_sync_at(&self) -> DateTime<Utc> {
        self.last_sync_at
    }

    /// Commit an accepted action: bump the version, stamp the action with it,
    /// extend the checksum chain, and buffer the action for replay.
    ///
    /// Returns the new version.
    pub fn commit(&mut self, mut action: SessionAction) -> u64 {
        self.version += 1;
        action.version = self.version;

        let mut builder = ChecksumBuilder::for_session_state();
        builder.update_checksum(&self.checksum);
        builder.update_u64(self.version);
        builder.update_str(&action.id);
        builder.update_str(&action.action_type);
        builder.update_str(&action.user_id);
        builder.update_str(&action.payload.to_string());
        self.checksum = builder.finalize();

        self.last_sync_at = Utc::now();
        self.pending.push(action);
        self.version
    }

    /// Record a rejection for diagnostics.
    pub fn record_conflict(&mut self, action_id: String, user_id: UserId, reason: RejectReason) {
        if self.conflicted.len() == self.conflict_capacity {
            self.conflicted.pop_front();
        }
        self.conflicted.push_back(ConflictedAction {
            action_id,
            user_id,
            reason,
            at: Utc::now(),
        });
    }

    /// Recent rejections, oldest first.
    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictedAction> {
        self.conflicted.iter()
    }

    /// Buffered action count.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Catch-up plan for a client that last saw `client_version`.
    ///
    /// A client claiming a version ahead of the authoritative one is treated
    /// as divergent and told to take a full resync.
    pub fn replay_since(&self, client_version: u64) -> ReplayPlan {
        if client_version == self.version {
            return ReplayPlan::UpToDate;
        }
        if client_version > self.version {
            return ReplayPlan::FullResync;
        }
        // The buffer covers the gap only if the first missing version
        // (client_version + 1) is still buffered.
        match self.pending.oldest_version() {
            Some(oldest) if oldest <= client_version + 1 => {
                ReplayPlan::Actions(self.pending.since(client_version))
            }
            Some(_) => ReplayPlan::FullResync,
            // Nothing buffered but versions differ: history was evicted
            // or never recorded, so replay cannot bridge the gap.
            None => ReplayPlan::FullResync,
        }
    }
}
