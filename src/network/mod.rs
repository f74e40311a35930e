//! Network Layer
//!
//! WebSocket transport, the per-connection registry, and the coordinator
//! routing frames into the session layer. Nothing here interprets action
//! payloads; that stays with the session layer and its applier.

pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod server;

pub use coordinator::SyncCoordinator;
pub use protocol::{
    ActionRejection, FullResyncData, HeartbeatReply, MessageType, ProtocolError, SyncMessage,
    SyncResponseData,
};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionStatus, SweepReport};
pub use server::{
    Authenticator, ClientIdentity, QueryAuthenticator, ServerConfig, ServerError, SyncServer,
};
