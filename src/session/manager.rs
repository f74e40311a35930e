//! Session Management
//!
//! Owns every live session: its versioned sync state, lock table, presence
//! map, and connected members. Admission runs in three phases so that the
//! per-session guard is never held across an applier await:
//!
//! 1. acquire the resource lock under the guard (fail fast if held),
//! 2. validate and apply outside the guard,
//! 3. re-acquire the guard to commit, release the lock, and fan out.
//!
//! Phase 2 is where actions addressing different resources overlap; the lock
//! taken in phase 1 is what keeps two actions off the same resource.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::core::ids::{ConnectionId, ResourceId, SessionId, UserId};
use crate::session::action::{
    ActionApplier, AdmissionOutcome, PermissiveApplier, RejectReason, SessionAction,
};
use crate::session::locks::LockTable;
use crate::session::presence::{PresenceTracker, UserPresence};
use crate::session::state::{ReplayPlan, SyncState};
use crate::{
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_REPLAY_CAPACITY, DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
};

/// Capacity of each session's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Tuning knobs shared by the session layer and the coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Silence longer than this disconnects a client.
    pub heartbeat_timeout: Duration,
    /// How often the maintenance loop sweeps connections and sessions.
    pub sweep_interval: Duration,
    /// How long an empty session survives before being reaped.
    pub session_idle_timeout: Duration,
    /// Accepted actions kept for replay, per session.
    pub replay_capacity: usize,
    /// Rejections kept for diagnostics, per session.
    pub conflict_log_capacity: usize,
    /// Outbound frames buffered per connection before drops begin.
    pub outbound_buffer: usize,
    /// Sustained sync_request rate allowed per connection, per second.
    pub sync_request_per_second: u32,
    /// Burst of sync_requests allowed above the sustained rate.
    pub sync_request_burst: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(5),
            session_idle_timeout: Duration::from_secs(DEFAULT_SESSION_IDLE_TIMEOUT_SECS),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            conflict_log_capacity: 64,
            outbound_buffer: 64,
            sync_request_per_second: 1,
            sync_request_burst: 5,
        }
    }
}

// =============================================================================
// EVENTS AND ERRORS
// =============================================================================

/// Observable session happenings, published on a per-session broadcast
/// channel for dashboards and tests.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An action was admitted at the version it carries.
    ActionAccepted {
        /// The stamped action.
        action: SessionAction,
    },
    /// An action was refused.
    ActionRejected {
        /// Id of the refused action.
        action_id: String,
        /// Who submitted it.
        user_id: UserId,
        /// Why it was refused.
        reason: RejectReason,
    },
    /// A resource lock was granted.
    LockAcquired {
        /// Locked resource.
        resource_id: ResourceId,
        /// Holder.
        user_id: UserId,
    },
    /// A resource lock was released.
    LockReleased {
        /// Freed resource.
        resource_id: ResourceId,
    },
    /// A presence record changed.
    PresenceUpdated {
        /// The new record.
        presence: UserPresence,
    },
    /// A connection joined the session.
    MemberJoined {
        /// Joining connection.
        connection_id: ConnectionId,
        /// Its user.
        user_id: UserId,
    },
    /// A connection left the session.
    MemberLeft {
        /// Departing connection.
        connection_id: ConnectionId,
        /// Its user.
        user_id: UserId,
    },
    /// The session was reaped after sitting empty too long.
    Reaped,
}

/// Errors from the manager's session-addressed operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// The session was never declared.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
}

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    /// Never declared.
    Unknown,
    /// Declared but not yet (or not currently) live.
    Declared,
    /// Live with at least one member.
    Active,
    /// Live with no members, awaiting reap or rejoin.
    Idle,
    /// Previously live, reaped; the declaration survives.
    Reaped,
}

/// Point-in-time counters for one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Session these counters describe.
    pub session_id: SessionId,
    /// Authoritative version.
    pub version: u64,
    /// Hex checksum at that version.
    pub checksum: String,
    /// Connected members.
    pub member_count: usize,
    /// Held resource locks.
    pub lock_count: usize,
    /// Tracked presence records.
    pub presence_count: usize,
    /// Actions available for replay.
    pub pending_actions: usize,
    /// When the last action was committed (session creation if none).
    pub last_sync_at: chrono::DateTime<chrono::Utc>,
}

/// Snapshot a lagging client syncs against.
#[derive(Debug)]
pub struct SyncView {
    /// Authoritative version.
    pub version: u64,
    /// Hex checksum at that version.
    pub checksum: String,
    /// How the client should catch up.
    pub plan: ReplayPlan,
}

// =============================================================================
// LIVE SESSION
// =============================================================================

struct SessionMember {
    user_id: UserId,
    outbound: mpsc::Sender<String>,
}

/// Everything the server holds for one running session. Guarded by the
/// `RwLock` in [`SessionHandle`]; methods here assume the guard is held.
struct LiveSession {
    session_id: SessionId,
    sync: SyncState,
    locks: LockTable,
    presence: PresenceTracker,
    members: BTreeMap<ConnectionId, SessionMember>,
    event_tx: broadcast::Sender<SessionEvent>,
    applier: Arc<dyn ActionApplier>,
    idle_since: Option<Instant>,
    retired: bool,
}

impl LiveSession {
    fn new(session_id: SessionId, config: &SyncConfig, applier: Arc<dyn ActionApplier>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session_id,
            sync: SyncState::new(config.replay_capacity, config.conflict_log_capacity),
            locks: LockTable::new(),
            presence: PresenceTracker::new(),
            members: BTreeMap::new(),
            event_tx,
            applier,
            idle_since: Some(Instant::now()),
            retired: false,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Send one already-serialized frame to every member except `exclude`.
    ///
    /// Slow consumers get frames dropped rather than stalling the session;
    /// a dropped client recovers through sync_request replay.
    fn broadcast_raw(&self, text: &str, exclude: Option<ConnectionId>) {
        for (connection_id, member) in &self.members {
            if Some(*connection_id) == exclude {
                continue;
            }
            match member.outbound.try_send(text.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        user_id = %member.user_id,
                        "outbound buffer full, dropping frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Connection already gone; the next sweep removes it.
                }
            }
        }
    }

    fn connections_of(&self, user_id: &str) -> usize {
        self.members
            .values()
            .filter(|m| m.user_id == user_id)
            .count()
    }
}

// =============================================================================
// SESSION HANDLE
// =============================================================================

/// Shared handle to one live session. Cheap to clone; all access is
/// serialized through the inner lock.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<LiveSession>>,
}

impl SessionHandle {
    fn new(session_id: SessionId, config: &SyncConfig, applier: Arc<dyn ActionApplier>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LiveSession::new(session_id, config, applier))),
        }
    }

    /// Submit an action without fanning it out. Library callers and tests
    /// use this; the coordinator uses [`SessionHandle::submit_with`].
    pub async fn submit(&self, action: SessionAction) -> AdmissionOutcome {
        self.admit(action, None, None::<fn(&SessionAction) -> String>)
            .await
    }

    /// Submit an action and, if accepted, broadcast the encoded result to
    /// every member except `exclude` (normally the submitter).
    ///
    /// `encode` is called once, after the action is stamped with its
    /// version, while the session guard is held; it must not block.
    pub async fn submit_with<F>(
        &self,
        action: SessionAction,
        exclude: Option<ConnectionId>,
        encode: F,
    ) -> AdmissionOutcome
    where
        F: FnOnce(&SessionAction) -> String,
    {
        self.admit(action, exclude, Some(encode)).await
    }

    async fn admit<F>(
        &self,
        action: SessionAction,
        exclude: Option<ConnectionId>,
        encode: Option<F>,
    ) -> AdmissionOutcome
    where
        F: FnOnce(&SessionAction) -> String,
    {
        let resource = action.resource();

        // Phase 1: lock acquisition under the guard.
        let applier = {
            let mut session = self.inner.write().await;
            if session.retired {
                session.sync.record_conflict(
                    action.id.clone(),
                    action.user_id.clone(),
                    RejectReason::SessionNotActive,
                );
                return AdmissionOutcome::rejected(
                    RejectReason::SessionNotActive,
                    format!("session {} is no longer active", session.session_id),
                );
            }
            if let Some(res) = resource.as_deref() {
                if let Err(held) = session.locks.acquire(res, &action.user_id) {
                    debug!(
                        session_id = %session.session_id,
                        resource_id = res,
                        holder = %held.holder,
                        rejected_user = %action.user_id,
                        "resource contention"
                    );
                    session.sync.record_conflict(
                        action.id.clone(),
                        action.user_id.clone(),
                        RejectReason::ResourceLocked,
                    );
                    session.emit(SessionEvent::ActionRejected {
                        action_id: action.id.clone(),
                        user_id: action.user_id.clone(),
                        reason: RejectReason::ResourceLocked,
                    });
                    return AdmissionOutcome::rejected(
                        RejectReason::ResourceLocked,
                        format!("resource {res} is locked by {}", held.holder),
                    );
                }
                session.emit(SessionEvent::LockAcquired {
                    resource_id: res.to_string(),
                    user_id: action.user_id.clone(),
                });
            }
            Arc::clone(&session.applier)
        };

        // Phase 2: validate and apply with the guard released. Only the
        // resource lock keeps competitors away.
        let verdict = applier.apply(&action).await;

        // Phase 3: commit or roll back, release the lock, fan out. Holding
        // the guard through the broadcast keeps frame order equal to commit
        // order.
        let mut session = self.inner.write().await;
        if session.retired {
            // Reaped while the applier ran; retire() already cleared the
            // lock table, so there is nothing to release or broadcast.
            session.sync.record_conflict(
                action.id.clone(),
                action.user_id.clone(),
                RejectReason::SessionNotActive,
            );
            return AdmissionOutcome::rejected(
                RejectReason::SessionNotActive,
                format!("session {} is no longer active", session.session_id),
            );
        }
        if let Some(res) = resource.as_deref() {
            session.locks.release(res, &action.user_id);
            session.emit(SessionEvent::LockReleased {
                resource_id: res.to_string(),
            });
        }
        match verdict {
            Ok(()) => {
                let version = session.sync.commit(action.clone());
                let mut stamped = action;
                stamped.version = version;
                if let Some(encode) = encode {
                    let text = encode(&stamped);
                    session.broadcast_raw(&text, exclude);
                }
                session.emit(SessionEvent::ActionAccepted { action: stamped });
                AdmissionOutcome::Accepted { version }
            }
            Err(err) => {
                session.sync.record_conflict(
                    action.id.clone(),
                    action.user_id.clone(),
                    RejectReason::InvalidAction,
                );
                session.emit(SessionEvent::ActionRejected {
                    action_id: action.id.clone(),
                    user_id: action.user_id.clone(),
                    reason: RejectReason::InvalidAction,
                });
                AdmissionOutcome::rejected(RejectReason::InvalidAction, err.message)
            }
        }
    }

    /// Record a presence update and relay the already-serialized envelope to
    /// every other member, atomically with the update.
    pub async fn publish_presence(
        &self,
        user_id: &str,
        status: &str,
        metadata: serde_json::Value,
        raw: &str,
        exclude: Option<ConnectionId>,
    ) -> UserPresence {
        let mut session = self.inner.write().await;
        let session_id = session.session_id.clone();
        let presence = session
            .presence
            .update(user_id, &session_id, status, metadata);
        session.broadcast_raw(raw, exclude);
        session.emit(SessionEvent::PresenceUpdated {
            presence: presence.clone(),
        });
        presence
    }

    /// Snapshot for a client that last saw `client_version`.
    pub async fn sync_view(&self, client_version: u64) -> SyncView {
        let session = self.inner.read().await;
        SyncView {
            version: session.sync.version(),
            checksum: session.sync.checksum_hex(),
            plan: session.sync.replay_since(client_version),
        }
    }

    /// Send one already-serialized frame to every member except `exclude`.
    pub async fn broadcast_raw(&self, text: &str, exclude: Option<ConnectionId>) {
        let session = self.inner.read().await;
        session.broadcast_raw(text, exclude);
    }

    /// Subscribe to this session's event stream.
    pub async fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.read().await.event_tx.subscribe()
    }

    /// Current authoritative version.
    pub async fn version(&self) -> u64 {
        self.inner.read().await.sync.version()
    }

    /// Current checksum in wire form.
    pub async fn checksum_hex(&self) -> String {
        self.inner.read().await.sync.checksum_hex()
    }

    /// Connected member count.
    pub async fn member_count(&self) -> usize {
        self.inner.read().await.members.len()
    }

    /// All presence records, ordered by user id.
    pub async fn presence_snapshot(&self) -> Vec<UserPresence> {
        self.inner.read().await.presence.all()
    }

    /// Point-in-time counters.
    pub async fn stats(&self) -> SessionStats {
        let session = self.inner.read().await;
        SessionStats {
            session_id: session.session_id.clone(),
            version: session.sync.version(),
            checksum: session.sync.checksum_hex(),
            member_count: session.members.len(),
            lock_count: session.locks.len(),
            presence_count: session.presence.len(),
            pending_actions: session.sync.pending_len(),
            last_sync_at: session.sync.last_sync_at(),
        }
    }

    /// Attach a connection to the session.
    pub(crate) async fn join(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        outbound: mpsc::Sender<String>,
    ) {
        let mut session = self.inner.write().await;
        session.members.insert(
            connection_id,
            SessionMember {
                user_id: user_id.to_string(),
                outbound,
            },
        );
        session.idle_since = None;
        session.emit(SessionEvent::MemberJoined {
            connection_id,
            user_id: user_id.to_string(),
        });
    }

    /// Detach a connection. When this was the user's last connection here,
    /// the presence record is flipped to disconnected and `notice` (if any)
    /// is broadcast to the remaining members, atomically with the removal so
    /// the notice goes out exactly once.
    ///
    /// Returns the departing user id, or `None` if the connection was not a
    /// member.
    pub(crate) async fn leave(
        &self,
        connection_id: ConnectionId,
        notice: Option<&str>,
    ) -> Option<UserId> {
        let mut session = self.inner.write().await;
        let member = session.members.remove(&connection_id)?;
        let user_id = member.user_id;
        session.emit(SessionEvent::MemberLeft {
            connection_id,
            user_id: user_id.clone(),
        });
        if session.connections_of(&user_id) == 0 {
            if let Some(presence) = session.presence.mark_disconnected(&user_id) {
                session.emit(SessionEvent::PresenceUpdated { presence });
            }
            if let Some(text) = notice {
                session.broadcast_raw(text, None);
            }
        }
        if session.members.is_empty() {
            session.idle_since = Some(Instant::now());
        }
        Some(user_id)
    }

    /// Whether the user still has a live connection in this session.
    pub(crate) async fn has_user(&self, user_id: &str) -> bool {
        self.inner.read().await.connections_of(user_id) > 0
    }

    async fn retire(&self) {
        let mut session = self.inner.write().await;
        session.retired = true;
        session.locks.clear();
        session.emit(SessionEvent::Reaped);
    }

    async fn reapable(&self, idle_timeout: Duration) -> bool {
        let session = self.inner.read().await;
        session.members.is_empty()
            && session
                .idle_since
                .map(|t| t.elapsed() >= idle_timeout)
                .unwrap_or(false)
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

struct SessionMeta {
    declared_at: chrono::DateTime<chrono::Utc>,
    last_reaped_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Registry of declared and live sessions.
///
/// A session must be declared before connections can register for it. The
/// declaration outlives the live state: a reaped session keeps its
/// declaration and comes back fresh at version 0 when someone rejoins.
pub struct SessionManager {
    declared: RwLock<BTreeMap<SessionId, SessionMeta>>,
    live: RwLock<BTreeMap<SessionId, SessionHandle>>,
    config: SyncConfig,
    applier: Arc<dyn ActionApplier>,
}

impl SessionManager {
    /// Manager that accepts every action (no rules engine attached).
    pub fn new(config: SyncConfig) -> Self {
        Self::with_applier(config, Arc::new(PermissiveApplier))
    }

    /// Manager that routes actions through `applier` for validation.
    pub fn with_applier(config: SyncConfig, applier: Arc<dyn ActionApplier>) -> Self {
        Self {
            declared: RwLock::new(BTreeMap::new()),
            live: RwLock::new(BTreeMap::new()),
            config,
            applier,
        }
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Declare a session so connections can register for it.
    ///
    /// Returns `false` if the id was already declared.
    pub async fn create_session(&self, session_id: &str) -> bool {
        let mut declared = self.declared.write().await;
        if declared.contains_key(session_id) {
            return false;
        }
        declared.insert(
            session_id.to_string(),
            SessionMeta {
                declared_at: chrono::Utc::now(),
                last_reaped_at: None,
            },
        );
        info!(session_id, "session declared");
        true
    }

    /// Whether `session_id` has been declared.
    pub async fn is_declared(&self, session_id: &str) -> bool {
        self.declared.read().await.contains_key(session_id)
    }

    /// Live handle for `session_id`, if the session is currently live.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.live.read().await.get(session_id).cloned()
    }

    /// Live handle for `session_id`, only while it has connected members.
    /// An idle session (live, zero members) reads as `None` here but is
    /// still reachable through [`get_session`](Self::get_session).
    pub async fn get_active_session(&self, session_id: &str) -> Option<SessionHandle> {
        let handle = self.get_session(session_id).await?;
        if handle.member_count().await == 0 {
            return None;
        }
        Some(handle)
    }

    /// Live handle for `session_id`, starting fresh state if the session is
    /// declared but not live (first join, or rejoin after a reap).
    pub async fn ensure_live(&self, session_id: &str) -> Result<SessionHandle, AdmissionError> {
        if !self.is_declared(session_id).await {
            return Err(AdmissionError::UnknownSession(session_id.to_string()));
        }
        let mut live = self.live.write().await;
        let handle = live
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id, "session going live");
                SessionHandle::new(
                    session_id.to_string(),
                    &self.config,
                    Arc::clone(&self.applier),
                )
            })
            .clone();
        Ok(handle)
    }

    /// Submit an action to its session, starting the session if needed.
    pub async fn submit_action(
        &self,
        action: SessionAction,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        let handle = self.ensure_live(&action.session_id).await?;
        Ok(handle.submit(action).await)
    }

    /// Where `session_id` is in its life.
    pub async fn lifecycle(&self, session_id: &str) -> SessionLifecycle {
        if let Some(handle) = self.get_session(session_id).await {
            return if handle.member_count().await > 0 {
                SessionLifecycle::Active
            } else {
                SessionLifecycle::Idle
            };
        }
        match self.declared.read().await.get(session_id) {
            Some(meta) if meta.last_reaped_at.is_some() => SessionLifecycle::Reaped,
            Some(_) => SessionLifecycle::Declared,
            None => SessionLifecycle::Unknown,
        }
    }

    /// Number of declared sessions.
    pub async fn declared_count(&self) -> usize {
        self.declared.read().await.len()
    }

    /// Number of live sessions.
    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    /// When each declared session was created.
    pub async fn declared_at(&self, session_id: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.declared.read().await.get(session_id).map(|m| m.declared_at)
    }

    /// Tear down sessions that have sat empty past the idle timeout.
    ///
    /// Reaped ids are returned for logging. Declarations survive.
    pub async fn reap_idle(&self) -> Vec<SessionId> {
        let candidates: Vec<(SessionId, SessionHandle)> = {
            let live = self.live.read().await;
            let mut out = Vec::new();
            for (id, handle) in live.iter() {
                if handle.reapable(self.config.session_idle_timeout).await {
                    out.push((id.clone(), handle.clone()));
                }
            }
            out
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut reaped = Vec::new();
        let mut live = self.live.write().await;
        let mut declared = self.declared.write().await;
        for (id, handle) in candidates {
            // Re-check under the write guard; someone may have joined since.
            if !handle.reapable(self.config.session_idle_timeout).await {
                continue;
            }
            handle.retire().await;
            live.remove(&id);
            if let Some(meta) = declared.get_mut(&id) {
                meta.last_reaped_at = Some(chrono::Utc::now());
            }
            info!(session_id = %id, "session reaped");
            reaped.push(id);
        }
        reaped
    }
}
