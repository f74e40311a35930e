//! Session Layer
//!
//! Authoritative per-session state and the admission path actions take
//! through it:
//!
//! - [`action`]: proposed mutations, admission outcomes, pluggable appliers
//! - [`locks`]: per-resource exclusive locks (first wins)
//! - [`presence`]: advisory who-is-doing-what records
//! - [`state`]: version counter, checksum chain, replay buffer
//! - [`manager`]: live sessions, lifecycle, the three-phase admission path

pub mod action;
pub mod locks;
pub mod manager;
pub mod presence;
pub mod state;

pub use action::{
    ActionApplier, AdmissionOutcome, ApplyError, PermissiveApplier, RejectReason, SessionAction,
};
pub use locks::{LockTable, ResourceLock};
pub use manager::{
    AdmissionError, SessionEvent, SessionHandle, SessionLifecycle, SessionManager, SessionStats,
    SyncConfig, SyncView,
};
pub use presence::{PresenceTracker, UserPresence, STATUS_DISCONNECTED, STATUS_ONLINE};
pub use state::{ConflictedAction, ReplayBuffer, ReplayPlan, SyncState};
