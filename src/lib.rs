//! # Tabletop Sync Server
//!
//! Realtime synchronization core for shared virtual tabletop sessions. The
//! server is the authority on session state: clients propose actions, the
//! server admits them one version at a time, and every other client hears
//! about what was admitted. Clients that fall behind replay what they missed
//! from a bounded buffer, or refetch the document when the gap is too wide.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TABLETOP SYNC SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Shared primitives                       │
//! │  ├── ids.rs        - Session/user/resource/connection ids    │
//! │  └── checksum.rs   - Rolling state checksum (SHA-256)        │
//! │                                                              │
//! │  session/          - Authoritative session state             │
//! │  ├── action.rs     - Actions, admission outcomes, appliers   │
//! │  ├── locks.rs      - Per-resource exclusive locks            │
//! │  ├── presence.rs   - Who-is-doing-what records               │
//! │  ├── state.rs      - Version counter + replay buffer         │
//! │  └── manager.rs    - Live sessions and the admission path    │
//! │                                                              │
//! │  network/          - Transport and routing                   │
//! │  ├── server.rs     - WebSocket accept loop, auth seam        │
//! │  ├── registry.rs   - Connection identity and liveness        │
//! │  ├── coordinator.rs- Frame routing, heartbeats, resync       │
//! │  └── protocol.rs   - The JSON wire envelope                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Model
//!
//! Each session carries a version counter that increments by exactly one per
//! accepted action, and a rolling checksum chained over the accepted history.
//! Actions addressing the same resource are serialized by a first-wins lock;
//! losers are rejected immediately and retry against the newer state. Actions
//! on different resources admit concurrently.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod session;

// Re-export the surface most callers need
pub use crate::core::checksum::{encode_checksum, Checksum, ChecksumBuilder};
pub use crate::core::ids::{ConnectionId, ResourceId, SessionId, UserId};
pub use network::coordinator::SyncCoordinator;
pub use network::protocol::{MessageType, ProtocolError, SyncMessage};
pub use network::registry::{ConnectionRegistry, ConnectionStatus};
pub use network::server::{Authenticator, ServerConfig, ServerError, SyncServer};
pub use session::action::{
    ActionApplier, AdmissionOutcome, ApplyError, RejectReason, SessionAction,
};
pub use session::manager::{
    AdmissionError, SessionEvent, SessionHandle, SessionLifecycle, SessionManager, SyncConfig,
};
pub use session::presence::UserPresence;
pub use session::state::ReplayPlan;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seconds of silence before a connection is presumed dead
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Seconds an empty session survives before being reaped
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 300;

/// Accepted actions each session keeps for replay
pub const DEFAULT_REPLAY_CAPACITY: usize = 256;
