//! Identifier Types
//!
//! Session, user, and resource identifiers are opaque strings minted by the
//! upstream auth collaborator; this core never interprets them. Connection
//! identifiers are minted server-side, one per physical transport connection,
//! and are never reused (a reconnect gets a fresh id).

use uuid::Uuid;

/// Identifier of a shared live session (e.g. one game table).
pub type SessionId = String;

/// Identifier of a participant, as resolved by the auth collaborator.
pub type UserId = String;

/// Identifier of an independently lockable piece of session state
/// (e.g. one token on the table).
pub type ResourceId = String;

/// Identifier of a single physical transport connection.
///
/// Generated on transport open, terminal on close/timeout.
pub type ConnectionId = Uuid;

/// Mint a fresh connection identifier.
pub fn new_connection_id() -> ConnectionId {
    Uuid::new_v4()
}

/// Mint a fresh wire message identifier for server-originated envelopes.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
