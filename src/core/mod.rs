//! Core primitives shared by the session and network layers.
//!
//! Identifier types and the checksum machinery live here so that both the
//! admission layer and the transport layer can depend on them without
//! depending on each other.

pub mod checksum;
pub mod ids;

// Re-export core types
pub use checksum::{encode_checksum, Checksum, ChecksumBuilder, EMPTY_CHECKSUM};
pub use ids::{new_connection_id, new_message_id, ConnectionId, ResourceId, SessionId, UserId};
