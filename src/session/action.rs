//! Session Actions
//!
//! A `SessionAction` is a proposed atomic mutation to session state. Actions
//! are built from incoming wire envelopes, validated and versioned by the
//! session manager, and replayed to lagging clients from the pending-action
//! buffer. The meaning of an action's payload belongs to the rules layer
//! riding on top of this core; admission only cares about the addressed
//! resource and the applier's verdict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ResourceId, SessionId, UserId};

/// A proposed atomic mutation to session state.
///
/// `version` is 0 until the session manager accepts the action and stamps it
/// with the session version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAction {
    /// Action identifier, echoed back on rejection so the sender can roll back.
    pub id: String,
    /// Action type tag, owned by the rules collaborator (e.g. "move", "chat").
    #[serde(rename = "type")]
    pub action_type: String,
    /// Submitting user.
    pub user_id: UserId,
    /// Target session.
    pub session_id: SessionId,
    /// Opaque payload, interpreted only by the applier.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Client-side submission time.
    pub timestamp: DateTime<Utc>,
    /// Session version produced by accepting this action (0 = not admitted).
    #[serde(default)]
    pub version: u64,
}

impl SessionAction {
    /// Resource addressed by this action, if any.
    ///
    /// Actions that name a `resourceId` in their payload are serialized per
    /// resource through the conflict resolver; actions without one bypass
    /// locking entirely.
    pub fn resource_id(&self) -> Option<&str> {
        self.payload.get("resourceId").and_then(|v| v.as_str())
    }

    /// Typed view of the addressed resource.
    pub fn resource(&self) -> Option<ResourceId> {
        self.resource_id().map(str::to_owned)
    }
}

// =============================================================================
// ADMISSION OUTCOMES
// =============================================================================

/// Why an action was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The addressed resource is locked by another in-flight action.
    ResourceLocked,
    /// The applier refused the action.
    InvalidAction,
    /// The session is not accepting actions (reaped or never started).
    SessionNotActive,
}

impl RejectReason {
    /// Wire representation, matching the serde encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ResourceLocked => "resource_locked",
            RejectReason::InvalidAction => "invalid_action",
            RejectReason::SessionNotActive => "session_not_active",
        }
    }
}

/// Result of submitting an action to the admission path.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    /// The action was applied; the session is now at `version`.
    Accepted {
        /// Session version produced by this action.
        version: u64,
    },
    /// The action was refused; the session state is unchanged.
    Rejected {
        /// Machine-readable reason, sent back to the submitter.
        reason: RejectReason,
        /// Human-readable detail for logs and the rejection reply.
        message: String,
    },
}

impl AdmissionOutcome {
    /// Whether the action was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionOutcome::Accepted { .. })
    }

    /// Convenience constructor for a rejection.
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        AdmissionOutcome::Rejected {
            reason,
            message: message.into(),
        }
    }
}

// =============================================================================
// PLUGGABLE APPLIERS
// =============================================================================

/// Error returned by an applier that refuses an action.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApplyError {
    /// Why the applier refused.
    pub message: String,
}

impl ApplyError {
    /// Create an apply error from any printable reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Applies an accepted action's effect to the authoritative document.
///
/// The document itself (token positions, combat trackers, chat log) lives
/// with the rules collaborator; this core invokes the applier inside the
/// per-resource critical section and treats an `Err` as a rejection with
/// reason `invalid_action`. Appliers must be safe to call concurrently for
/// actions addressing *different* resources.
#[async_trait]
pub trait ActionApplier: Send + Sync {
    /// Validate and apply one action. Called at most once per submission.
    async fn apply(&self, action: &SessionAction) -> Result<(), ApplyError>;
}

/// Default applier that accepts every action without interpreting it.
///
/// Useful for pure relay deployments and tests; real deployments inject
/// their rules engine instead.
#[derive(Debug, Default)]
pub struct PermissiveApplier;

#[async_trait]
impl ActionApplier for PermissiveApplier {
    async fn apply(&self, _action: &SessionAction) -> Result<(), ApplyError> {
        Ok(())
    }
}
