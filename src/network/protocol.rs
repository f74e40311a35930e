//! Protocol Messages
//!
//! One JSON envelope carries every frame in both directions. The `type` tag
//! selects the handling path; `data` stays opaque to the transport and is
//! interpreted per type. Field names are camelCase on the wire.
//!
//! ```json
//! {
//!   "id": "a2a9c5d0-...",       // unique per message
//!   "type": "action",
//!   "sessionId": "table-1",
//!   "userId": "alice",
//!   "data": { "type": "move", "payload": { "resourceId": "tok1" } },
//!   "timestamp": "2025-04-01T12:00:00Z",
//!   "version": 17
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{new_message_id, SessionId, UserId};
use crate::session::action::{RejectReason, SessionAction};

/// Errors turning bytes into envelopes or envelopes into actions.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not valid JSON, or missing/mistyped envelope fields (including an
    /// unrecognized `type`).
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Tried to read an action out of a non-action envelope.
    #[error("expected an action envelope, got {0:?}")]
    NotAction(MessageType),

    /// Action data lacks the required string field `type`.
    #[error("action data missing string field `type`")]
    MissingActionType,
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Message kinds, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A proposed state mutation (client) or an accepted/rejected one (server).
    Action,
    /// Activity status update, relayed to other members.
    Presence,
    /// Liveness probe; the server echoes with timing data.
    Heartbeat,
    /// Client asks to catch up from the version it last saw.
    SyncRequest,
    /// Server's catch-up answer: missing actions or a full-resync marker.
    SyncResponse,
}

/// The one wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Unique message id, echoed in rejection replies.
    pub id: String,
    /// Handling path selector.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Session this frame belongs to.
    pub session_id: SessionId,
    /// Sender (or addressee, for server frames).
    pub user_id: UserId,
    /// Type-specific body, opaque to the transport.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Sender's clock at send time.
    pub timestamp: DateTime<Utc>,
    /// State version, where the type calls for one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl SyncMessage {
    /// Build a server-originated envelope, stamped with a fresh id and the
    /// server clock.
    pub fn server(
        kind: MessageType,
        session_id: impl Into<SessionId>,
        user_id: impl Into<UserId>,
        data: serde_json::Value,
        version: Option<u64>,
    ) -> Self {
        Self {
            id: new_message_id(),
            kind,
            session_id: session_id.into(),
            user_id: user_id.into(),
            data,
            timestamp: Utc::now(),
            version,
        }
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an envelope, rejecting unknown types and missing fields.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Version the sender claims to hold, for sync requests. Envelope field
    /// first, then `data.version`, else 0 (never synced).
    pub fn client_version(&self) -> u64 {
        self.version
            .or_else(|| self.data.get("version").and_then(|v| v.as_u64()))
            .unwrap_or(0)
    }

    /// Interpret an action envelope as a [`SessionAction`].
    ///
    /// The action type comes from `data.type`. The payload is `data.payload`
    /// when present; otherwise the remaining `data` fields stand in for it,
    /// so compact clients can write `{"type": "move", "resourceId": "tok1"}`.
    pub fn to_action(&self) -> Result<SessionAction, ProtocolError> {
        if self.kind != MessageType::Action {
            return Err(ProtocolError::NotAction(self.kind));
        }
        let action_type = self
            .data
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(ProtocolError::MissingActionType)?
            .to_string();
        let payload = match self.data.get("payload") {
            Some(p) => p.clone(),
            None => {
                let mut rest = serde_json::Map::new();
                if let Some(obj) = self.data.as_object() {
                    for (k, v) in obj {
                        if k != "type" {
                            rest.insert(k.clone(), v.clone());
                        }
                    }
                }
                serde_json::Value::Object(rest)
            }
        };
        Ok(SessionAction {
            id: self.id.clone(),
            action_type,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            payload,
            timestamp: self.timestamp,
            version: 0,
        })
    }

    /// Wrap an accepted action for fan-out.
    ///
    /// The submitter's message id and timestamp are kept so receivers can
    /// correlate the frame with what they saw (or sent) before; the envelope
    /// version is the version the action was assigned.
    pub fn from_action(action: &SessionAction) -> Self {
        Self {
            id: action.id.clone(),
            kind: MessageType::Action,
            session_id: action.session_id.clone(),
            user_id: action.user_id.clone(),
            data: serde_json::json!({
                "type": action.action_type,
                "payload": action.payload,
            }),
            timestamp: action.timestamp,
            version: Some(action.version),
        }
    }

    /// Rejection reply for `original`, addressed back to its sender.
    pub fn rejection(original: &SyncMessage, reason: RejectReason, message: &str) -> Self {
        Self::rejection_for(
            original.session_id.clone(),
            original.user_id.clone(),
            original.id.clone(),
            reason,
            message,
        )
    }

    /// Rejection reply assembled from parts, for actions that no longer have
    /// their original envelope around.
    pub fn rejection_for(
        session_id: SessionId,
        user_id: UserId,
        action_id: String,
        reason: RejectReason,
        message: &str,
    ) -> Self {
        let body = ActionRejection {
            status: "rejected".to_string(),
            action_id,
            reason,
            message: message.to_string(),
        };
        Self::server(
            MessageType::Action,
            session_id,
            user_id,
            serde_json::to_value(body).unwrap_or_default(),
            None,
        )
    }
}

// =============================================================================
// TYPED BODIES
// =============================================================================

/// `data` of a rejection reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRejection {
    /// Always `"rejected"`.
    pub status: String,
    /// Id of the refused envelope.
    pub action_id: String,
    /// Machine-readable reason.
    pub reason: RejectReason,
    /// Human-readable detail.
    pub message: String,
}

/// `data` of a heartbeat reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    /// Server clock when the heartbeat was handled.
    pub server_time: DateTime<Utc>,
    /// One-way latency estimate in milliseconds, from the client's send
    /// timestamp. Absent when the client clock is ahead of the server's.
    #[serde(rename = "latency", skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

/// `data` of a sync response carrying replayable actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseData {
    /// Authoritative version.
    pub version: u64,
    /// Hex state checksum at that version.
    pub checksum: String,
    /// Missed actions, oldest first. Empty when the client is current.
    pub actions: Vec<SessionAction>,
}

/// `data` of a sync response telling the client to refetch everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullResyncData {
    /// Always `true`.
    pub full_resync: bool,
    /// Authoritative version the full fetch will land on.
    pub version: u64,
    /// Hex state checksum at that version.
    pub checksum: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, data: serde_json::Value) -> String {
        json!({
            "id": "m1",
            "type": kind,
            "sessionId": "table-1",
            "userId": "alice",
            "data": data,
            "timestamp": "2025-04-01T12:00:00Z",
        })
        .to_string()
    }

    #[test]
    fn test_parse_action_envelope() {
        let raw = envelope("action", json!({"type": "move", "payload": {"resourceId": "tok1"}}));
        let msg = SyncMessage::from_json(&raw).unwrap();
        assert_eq!(msg.kind, MessageType::Action);
        assert_eq!(msg.session_id, "table-1");
        assert_eq!(msg.version, None);

        let action = msg.to_action().unwrap();
        assert_eq!(action.id, "m1");
        assert_eq!(action.action_type, "move");
        assert_eq!(action.resource_id(), Some("tok1"));
    }

    #[test]
    fn test_compact_action_folds_data_into_payload() {
        let raw = envelope("action", json!({"type": "move", "resourceId": "tok1", "x": 5}));
        let action = SyncMessage::from_json(&raw).unwrap().to_action().unwrap();
        assert_eq!(action.resource_id(), Some("tok1"));
        assert_eq!(action.payload.get("x"), Some(&json!(5)));
        assert!(action.payload.get("type").is_none());
    }

    #[test]
    fn test_action_without_type_rejected() {
        let raw = envelope("action", json!({"payload": {}}));
        let err = SyncMessage::from_json(&raw).unwrap().to_action().unwrap_err();
        assert!(matches!(err, ProtocolError::MissingActionType));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = envelope("teleport", json!({}));
        assert!(matches!(
            SyncMessage::from_json(&raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_json_rejected() {
        let raw = envelope("heartbeat", json!({}));
        assert!(SyncMessage::from_json(&raw[..raw.len() / 2]).is_err());
    }

    #[test]
    fn test_missing_session_rejected() {
        let raw = json!({
            "id": "m1",
            "type": "heartbeat",
            "userId": "alice",
            "data": {},
            "timestamp": "2025-04-01T12:00:00Z",
        })
        .to_string();
        assert!(SyncMessage::from_json(&raw).is_err());
    }

    #[test]
    fn test_version_omitted_when_none() {
        let msg = SyncMessage::server(
            MessageType::Heartbeat,
            "table-1",
            "alice",
            json!({}),
            None,
        );
        let raw = msg.to_json().unwrap();
        assert!(!raw.contains("\"version\""));

        let stamped = SyncMessage::server(
            MessageType::Action,
            "table-1",
            "alice",
            json!({}),
            Some(3),
        );
        assert!(stamped.to_json().unwrap().contains("\"version\":3"));
    }

    #[test]
    fn test_client_version_sources() {
        let raw = envelope("sync_request", json!({"version": 7}));
        assert_eq!(SyncMessage::from_json(&raw).unwrap().client_version(), 7);

        let mut with_field = SyncMessage::from_json(&raw).unwrap();
        with_field.version = Some(9);
        assert_eq!(with_field.client_version(), 9);

        let bare = envelope("sync_request", json!({}));
        assert_eq!(SyncMessage::from_json(&bare).unwrap().client_version(), 0);
    }

    #[test]
    fn test_rejection_reply_shape() {
        let raw = envelope("action", json!({"type": "move", "resourceId": "tok1"}));
        let original = SyncMessage::from_json(&raw).unwrap();
        let reply = SyncMessage::rejection(&original, RejectReason::ResourceLocked, "held by bob");

        assert_eq!(reply.kind, MessageType::Action);
        assert_eq!(reply.user_id, "alice");
        assert_eq!(reply.data["status"], "rejected");
        assert_eq!(reply.data["actionId"], "m1");
        assert_eq!(reply.data["reason"], "resource_locked");
    }

    #[test]
    fn test_fanout_envelope_carries_assigned_version() {
        let raw = envelope("action", json!({"type": "move", "resourceId": "tok1"}));
        let mut action = SyncMessage::from_json(&raw).unwrap().to_action().unwrap();
        action.version = 4;

        let fanout = SyncMessage::from_action(&action);
        assert_eq!(fanout.version, Some(4));
        assert_eq!(fanout.id, "m1");
        let rewire = fanout.to_json().unwrap();
        assert!(rewire.contains("\"type\":\"action\""));
        assert!(rewire.contains("\"resourceId\":\"tok1\""));
    }

    #[test]
    fn test_kinds_snake_case_on_wire() {
        for (kind, tag) in [
            (MessageType::Action, "action"),
            (MessageType::Presence, "presence"),
            (MessageType::Heartbeat, "heartbeat"),
            (MessageType::SyncRequest, "sync_request"),
            (MessageType::SyncResponse, "sync_response"),
        ] {
            let msg = SyncMessage::server(kind, "s", "u", json!({}), None);
            assert!(msg.to_json().unwrap().contains(&format!("\"type\":\"{tag}\"")));
        }
    }
}
