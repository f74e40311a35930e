//! Realtime Sync Coordinator
//!
//! The hub between transports and sessions. Every inbound frame lands in
//! [`SyncCoordinator::handle_message`], which verifies the sender against the
//! connection registry, then routes by envelope type: actions go through the
//! admission path, presence is relayed, heartbeats are answered, sync
//! requests are served from the replay buffer. A maintenance loop sweeps
//! silent connections and reaps empty sessions.
//!
//! The coordinator never talks to sockets directly; it writes to each
//! connection's outbound channel and leaves the socket I/O to the server.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::ids::ConnectionId;
use crate::network::protocol::{
    FullResyncData, HeartbeatReply, MessageType, SyncMessage, SyncResponseData,
};
use crate::network::registry::{ConnectionRegistry, ConnectionSnapshot};
use crate::session::action::{AdmissionOutcome, RejectReason, SessionAction};
use crate::session::manager::{AdmissionError, SessionHandle, SessionManager, SyncConfig};
use crate::session::presence::{STATUS_DISCONNECTED, STATUS_ONLINE};
use crate::session::state::ReplayPlan;

/// Routes frames between registered connections and their sessions.
pub struct SyncCoordinator {
    config: SyncConfig,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
}

impl SyncCoordinator {
    /// Coordinator over `sessions`, with a fresh registry built from the
    /// manager's configuration.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let config = sessions.config().clone();
        Self {
            registry: Arc::new(ConnectionRegistry::new(&config)),
            sessions,
            config,
        }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Total registered connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Snapshots of every connection in `session_id`.
    pub async fn session_connections(&self, session_id: &str) -> Vec<ConnectionSnapshot> {
        self.registry.session_connections(session_id).await
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Register a verified connection: join its session and start tracking
    /// liveness. Fails if the session was never declared.
    pub async fn register_connection(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        session_id: &str,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), AdmissionError> {
        let handle = self.sessions.ensure_live(session_id).await?;
        handle.join(connection_id, user_id, outbound.clone()).await;
        self.registry
            .insert(connection_id, user_id, session_id, outbound)
            .await;
        info!(
            connection_id = %connection_id,
            user_id,
            session_id,
            "connection registered"
        );
        Ok(())
    }

    /// Tear down a connection after a clean close. Safe to call twice; the
    /// second call finds nothing to remove.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        if let Some(snapshot) = self.registry.remove(connection_id).await {
            info!(
                connection_id = %connection_id,
                user_id = %snapshot.user_id,
                "connection closed"
            );
            self.finalize_departure(snapshot).await;
        }
    }

    /// Detach a removed connection from its session and, when it was the
    /// user's last one there, announce the disappearance to the remaining
    /// members.
    async fn finalize_departure(&self, snapshot: ConnectionSnapshot) {
        let Some(handle) = self.sessions.get_session(&snapshot.session_id).await else {
            return;
        };
        let notice = SyncMessage::server(
            MessageType::Presence,
            snapshot.session_id.clone(),
            snapshot.user_id.clone(),
            serde_json::json!({ "status": STATUS_DISCONNECTED }),
            None,
        );
        let notice_text = notice.to_json().ok();
        handle
            .leave(snapshot.connection_id, notice_text.as_deref())
            .await;
    }

    // =========================================================================
    // INBOUND ROUTING
    // =========================================================================

    /// Handle one inbound frame from `connection_id`.
    ///
    /// Frames that cannot be verified (malformed, unregistered sender, user
    /// id not matching the registered identity) are dropped; everything else
    /// refreshes the sender's liveness clock before being routed.
    pub async fn handle_message(&self, connection_id: ConnectionId, raw: &str) {
        let msg = match SyncMessage::from_json(raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "dropping malformed frame");
                return;
            }
        };
        let Some((user_id, session_id)) = self.registry.identity(connection_id).await else {
            warn!(connection_id = %connection_id, "frame from unregistered connection");
            return;
        };
        if msg.user_id != user_id {
            warn!(
                connection_id = %connection_id,
                claimed = %msg.user_id,
                registered = %user_id,
                "user id mismatch, dropping frame"
            );
            return;
        }
        self.registry.touch(connection_id).await;

        if msg.session_id != session_id {
            warn!(
                connection_id = %connection_id,
                claimed = %msg.session_id,
                registered = %session_id,
                "session id mismatch, dropping frame"
            );
            return;
        }
        // A reaped session's stragglers are ignored like unknown senders.
        let Some(handle) = self.sessions.get_session(&session_id).await else {
            warn!(
                connection_id = %connection_id,
                session_id = %session_id,
                "frame for a session that is not live, dropping"
            );
            return;
        };

        match msg.kind {
            MessageType::Action => self.handle_action(connection_id, &handle, msg).await,
            MessageType::Presence => self.handle_presence(connection_id, &handle, msg, raw).await,
            MessageType::Heartbeat => self.handle_heartbeat(connection_id, msg).await,
            MessageType::SyncRequest => self.handle_sync_request(connection_id, &handle, msg).await,
            MessageType::SyncResponse => self.handle_reconcile(connection_id, &handle, msg).await,
        }
    }

    /// Run an action through admission. Accepted actions fan out to the other
    /// members with their assigned version; rejections go back to the sender.
    async fn handle_action(
        &self,
        connection_id: ConnectionId,
        handle: &SessionHandle,
        msg: SyncMessage,
    ) {
        let action = match msg.to_action() {
            Ok(action) => action,
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "unusable action data");
                self.reply(
                    connection_id,
                    SyncMessage::rejection(&msg, RejectReason::InvalidAction, &err.to_string()),
                )
                .await;
                return;
            }
        };
        let outcome = self
            .submit_and_fanout(connection_id, handle, action)
            .await;
        if let AdmissionOutcome::Rejected { reason, message } = outcome {
            self.reply(connection_id, SyncMessage::rejection(&msg, reason, &message))
                .await;
        }
    }

    async fn submit_and_fanout(
        &self,
        connection_id: ConnectionId,
        handle: &SessionHandle,
        action: SessionAction,
    ) -> AdmissionOutcome {
        handle
            .submit_with(action, Some(connection_id), |stamped| {
                SyncMessage::from_action(stamped)
                    .to_json()
                    .unwrap_or_default()
            })
            .await
    }

    /// Record the sender's presence and relay the frame, unchanged, to the
    /// other members.
    async fn handle_presence(
        &self,
        connection_id: ConnectionId,
        handle: &SessionHandle,
        msg: SyncMessage,
        raw: &str,
    ) {
        let status = msg
            .data
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or(STATUS_ONLINE);
        handle
            .publish_presence(
                &msg.user_id,
                status,
                msg.data.clone(),
                raw,
                Some(connection_id),
            )
            .await;
    }

    /// Answer a heartbeat with the server clock and a latency estimate from
    /// the client's send timestamp. Skewed client clocks yield no estimate.
    async fn handle_heartbeat(&self, connection_id: ConnectionId, msg: SyncMessage) {
        let now = Utc::now();
        let elapsed = (now - msg.timestamp).num_milliseconds();
        let latency_ms = (elapsed >= 0).then_some(elapsed);
        self.registry
            .record_heartbeat(connection_id, latency_ms)
            .await;

        let reply_body = HeartbeatReply {
            server_time: now,
            latency_ms,
        };
        self.reply(
            connection_id,
            SyncMessage::server(
                MessageType::Heartbeat,
                msg.session_id,
                msg.user_id,
                serde_json::to_value(reply_body).unwrap_or_default(),
                None,
            ),
        )
        .await;
    }

    /// Serve a catch-up request from the replay buffer, or tell the client
    /// to take a full resync when the buffer cannot bridge the gap.
    /// Over-limit requests are dropped; the client's next allowed request
    /// will be served.
    async fn handle_sync_request(
        &self,
        connection_id: ConnectionId,
        handle: &SessionHandle,
        msg: SyncMessage,
    ) {
        if !self.registry.check_sync_rate(connection_id).await {
            debug!(
                connection_id = %connection_id,
                user_id = %msg.user_id,
                "sync_request over rate limit, dropping"
            );
            return;
        }
        let client_version = msg.client_version();
        let view = handle.sync_view(client_version).await;
        let data = match view.plan {
            ReplayPlan::UpToDate => serde_json::to_value(SyncResponseData {
                version: view.version,
                checksum: view.checksum,
                actions: Vec::new(),
            }),
            ReplayPlan::Actions(actions) => serde_json::to_value(SyncResponseData {
                version: view.version,
                checksum: view.checksum,
                actions,
            }),
            ReplayPlan::FullResync => serde_json::to_value(FullResyncData {
                full_resync: true,
                version: view.version,
                checksum: view.checksum,
            }),
        };
        let Ok(data) = data else { return };
        self.reply(
            connection_id,
            SyncMessage::server(
                MessageType::SyncResponse,
                msg.session_id,
                msg.user_id,
                data,
                Some(view.version),
            ),
        )
        .await;
    }

    /// Accept a client-pushed sync_response: actions it queued while offline
    /// are resubmitted one by one through the normal admission path. Actions
    /// claiming another user are dropped.
    async fn handle_reconcile(
        &self,
        connection_id: ConnectionId,
        handle: &SessionHandle,
        msg: SyncMessage,
    ) {
        let actions: Vec<SessionAction> = match msg.data.get("actions") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(actions) => actions,
                Err(err) => {
                    debug!(connection_id = %connection_id, error = %err, "unusable reconcile data");
                    return;
                }
            },
            None => return,
        };
        for mut action in actions {
            if action.user_id != msg.user_id {
                warn!(
                    connection_id = %connection_id,
                    claimed = %action.user_id,
                    "reconciled action claims another user, dropping"
                );
                continue;
            }
            action.session_id = msg.session_id.clone();
            action.version = 0;
            let action_id = action.id.clone();
            let outcome = self
                .submit_and_fanout(connection_id, handle, action)
                .await;
            if let AdmissionOutcome::Rejected { reason, message } = outcome {
                self.reply(
                    connection_id,
                    SyncMessage::rejection_for(
                        msg.session_id.clone(),
                        msg.user_id.clone(),
                        action_id,
                        reason,
                        &message,
                    ),
                )
                .await;
            }
        }
    }

    async fn reply(&self, connection_id: ConnectionId, msg: SyncMessage) {
        let Ok(text) = msg.to_json() else { return };
        if let Some(outbound) = self.registry.outbound(connection_id).await {
            if outbound.try_send(text).is_err() {
                debug!(connection_id = %connection_id, "reply dropped, outbound unavailable");
            }
        }
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// One sweep: time out silent connections, detach them from their
    /// sessions, and reap sessions that have sat empty too long.
    pub async fn maintenance_once(&self) {
        let report = self.registry.sweep().await;
        for snapshot in report.expired {
            info!(
                connection_id = %snapshot.connection_id,
                user_id = %snapshot.user_id,
                session_id = %snapshot.session_id,
                "connection timed out"
            );
            self.finalize_departure(snapshot).await;
        }
        let reaped = self.sessions.reap_idle().await;
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "idle sessions reaped");
        }
    }

    /// Maintenance loop, swept every `sweep_interval` until shutdown.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maintenance_once().await;
                }
                _ = shutdown.recv() => {
                    debug!("maintenance loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::new_connection_id;
    use crate::session::action::{ActionApplier, ApplyError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn test_config() -> SyncConfig {
        SyncConfig {
            heartbeat_timeout: Duration::from_millis(60),
            sweep_interval: Duration::from_millis(10),
            session_idle_timeout: Duration::from_millis(500),
            replay_capacity: 8,
            outbound_buffer: 16,
            ..SyncConfig::default()
        }
    }

    struct HoldApplier(Duration);

    #[async_trait]
    impl ActionApplier for HoldApplier {
        async fn apply(&self, _action: &SessionAction) -> Result<(), ApplyError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    async fn coordinator_with(config: SyncConfig) -> Arc<SyncCoordinator> {
        let sessions = Arc::new(SessionManager::new(config));
        sessions.create_session("table-1").await;
        Arc::new(SyncCoordinator::new(sessions))
    }

    async fn connect(
        coordinator: &SyncCoordinator,
        user: &str,
    ) -> (ConnectionId, Receiver<String>) {
        let id = new_connection_id();
        let (tx, rx) = mpsc::channel(16);
        coordinator
            .register_connection(id, user, "table-1", tx)
            .await
            .unwrap();
        (id, rx)
    }

    fn envelope(id: &str, kind: &str, user: &str, data: serde_json::Value) -> String {
        json!({
            "id": id,
            "type": kind,
            "sessionId": "table-1",
            "userId": user,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string()
    }

    fn action_frame(id: &str, user: &str, resource: &str) -> String {
        envelope(
            id,
            "action",
            user,
            json!({"type": "move", "payload": {"resourceId": resource, "x": 1}}),
        )
    }

    fn recv_frame(rx: &mut Receiver<String>) -> SyncMessage {
        let raw = rx.try_recv().unwrap();
        SyncMessage::from_json(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_register_requires_declared_session() {
        let coordinator = coordinator_with(test_config()).await;
        let (tx, _rx) = mpsc::channel(4);
        let err = coordinator
            .register_connection(new_connection_id(), "alice", "nowhere", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_action_fans_out_without_echo() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (_bob, mut bob_rx) = connect(&coordinator, "bob").await;

        coordinator
            .handle_message(alice, &action_frame("a1", "alice", "tok1"))
            .await;

        let frame = recv_frame(&mut bob_rx);
        assert_eq!(frame.kind, MessageType::Action);
        assert_eq!(frame.id, "a1");
        assert_eq!(frame.user_id, "alice");
        assert_eq!(frame.version, Some(1));
        assert_eq!(frame.data["payload"]["resourceId"], "tok1");

        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_contention_rejection_then_retry() {
        let config = test_config();
        let sessions = Arc::new(SessionManager::with_applier(
            config,
            Arc::new(HoldApplier(Duration::from_millis(60))),
        ));
        sessions.create_session("table-1").await;
        let coordinator = Arc::new(SyncCoordinator::new(sessions));

        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (bob, mut bob_rx) = connect(&coordinator, "bob").await;

        // Alice's action enters its apply window.
        let racing = {
            let coordinator = Arc::clone(&coordinator);
            let frame = action_frame("a1", "alice", "tok1");
            tokio::spawn(async move { coordinator.handle_message(alice, &frame).await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;

        // Bob collides on the same resource and is told so.
        coordinator
            .handle_message(bob, &action_frame("b1", "bob", "tok1"))
            .await;
        let rejection = recv_frame(&mut bob_rx);
        assert_eq!(rejection.data["status"], "rejected");
        assert_eq!(rejection.data["actionId"], "b1");
        assert_eq!(rejection.data["reason"], "resource_locked");

        // Alice's action lands at version 1 and reaches bob.
        racing.await.unwrap();
        let accepted = recv_frame(&mut bob_rx);
        assert_eq!(accepted.version, Some(1));

        // Bob retries and wins; alice sees version 2.
        coordinator
            .handle_message(bob, &action_frame("b2", "bob", "tok1"))
            .await;
        let frame = recv_frame(&mut alice_rx);
        assert_eq!(frame.version, Some(2));
        assert_eq!(frame.user_id, "bob");
    }

    #[tokio::test]
    async fn test_user_id_mismatch_dropped() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (_bob, mut bob_rx) = connect(&coordinator, "bob").await;

        coordinator
            .handle_message(alice, &action_frame("a1", "bob", "tok1"))
            .await;

        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
        let handle = coordinator.sessions().get_session("table-1").await.unwrap();
        assert_eq!(handle.version().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_session_frame_dropped() {
        let coordinator = coordinator_with(test_config()).await;
        coordinator.sessions().create_session("table-2").await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;

        let stray = json!({
            "id": "a1",
            "type": "action",
            "sessionId": "table-2",
            "userId": "alice",
            "data": {"type": "move"},
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();
        coordinator.handle_message(alice, &stray).await;

        // Dropped outright: no reply, and neither session advanced.
        assert!(alice_rx.try_recv().is_err());
        let handle = coordinator.sessions().get_session("table-1").await.unwrap();
        assert_eq!(handle.version().await, 0);
        assert!(coordinator.sessions().get_session("table-2").await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_action_data_rejected() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;

        // Parseable envelope, but the action body has no type.
        let frame = envelope("a1", "action", "alice", json!({"payload": {}}));
        coordinator.handle_message(alice, &frame).await;

        let reply = recv_frame(&mut alice_rx);
        assert_eq!(reply.data["reason"], "invalid_action");
        assert_eq!(reply.data["actionId"], "a1");
    }

    #[tokio::test]
    async fn test_heartbeat_reply_carries_latency() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;

        let sent_at = Utc::now() - chrono::Duration::milliseconds(50);
        let frame = json!({
            "id": "h1",
            "type": "heartbeat",
            "sessionId": "table-1",
            "userId": "alice",
            "data": {},
            "timestamp": sent_at.to_rfc3339(),
        })
        .to_string();
        coordinator.handle_message(alice, &frame).await;

        let reply = recv_frame(&mut alice_rx);
        assert_eq!(reply.kind, MessageType::Heartbeat);
        assert!(reply.data.get("serverTime").is_some());
        assert!(reply.data["latency"].as_i64().unwrap() >= 50);

        let snapshot = coordinator.registry().snapshot(alice).await.unwrap();
        assert!(snapshot.latency_ms.unwrap() >= 50);
    }

    #[tokio::test]
    async fn test_sync_request_replays_missed_actions() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (bob, mut bob_rx) = connect(&coordinator, "bob").await;

        for (id, res) in [("b1", "tok1"), ("b2", "tok2"), ("b3", "tok3")] {
            coordinator
                .handle_message(bob, &action_frame(id, "bob", res))
                .await;
        }
        while alice_rx.try_recv().is_ok() {}

        let request = envelope("s1", "sync_request", "alice", json!({"version": 1}));
        coordinator.handle_message(alice, &request).await;

        let response = recv_frame(&mut alice_rx);
        assert_eq!(response.kind, MessageType::SyncResponse);
        assert_eq!(response.version, Some(3));
        let actions = response.data["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0]["version"], 2);
        assert_eq!(actions[1]["version"], 3);
        assert!(!response.data["checksum"].as_str().unwrap().is_empty());

        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_request_up_to_date() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;

        let request = envelope("s1", "sync_request", "alice", json!({"version": 0}));
        coordinator.handle_message(alice, &request).await;

        let response = recv_frame(&mut alice_rx);
        assert_eq!(response.version, Some(0));
        assert!(response.data["actions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_request_full_resync_marker() {
        let config = SyncConfig {
            replay_capacity: 2,
            ..test_config()
        };
        let coordinator = coordinator_with(config).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (bob, _bob_rx) = connect(&coordinator, "bob").await;

        for (id, res) in [("b1", "t1"), ("b2", "t2"), ("b3", "t3"), ("b4", "t4")] {
            coordinator
                .handle_message(bob, &action_frame(id, "bob", res))
                .await;
        }
        while alice_rx.try_recv().is_ok() {}

        // Version 0 predates the two buffered actions.
        let request = envelope("s1", "sync_request", "alice", json!({"version": 0}));
        coordinator.handle_message(alice, &request).await;

        let response = recv_frame(&mut alice_rx);
        assert_eq!(response.data["fullResync"], true);
        assert_eq!(response.data["version"], 4);
        assert!(response.data.get("actions").is_none());
    }

    #[tokio::test]
    async fn test_sync_request_rate_limited() {
        let config = SyncConfig {
            sync_request_per_second: 1,
            sync_request_burst: 2,
            ..test_config()
        };
        let coordinator = coordinator_with(config).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;

        for i in 0..4 {
            let request = envelope(&format!("s{i}"), "sync_request", "alice", json!({}));
            coordinator.handle_message(alice, &request).await;
        }

        let mut served = 0;
        while alice_rx.try_recv().is_ok() {
            served += 1;
        }
        assert_eq!(served, 2);
    }

    #[tokio::test]
    async fn test_presence_relayed_verbatim_without_echo() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (_bob, mut bob_rx) = connect(&coordinator, "bob").await;

        let frame = envelope(
            "p1",
            "presence",
            "alice",
            json!({"status": "away", "cursor": [3, 4]}),
        );
        coordinator.handle_message(alice, &frame).await;

        assert_eq!(bob_rx.try_recv().unwrap(), frame);
        assert!(alice_rx.try_recv().is_err());

        let handle = coordinator.sessions().get_session("table-1").await.unwrap();
        let presence = handle.presence_snapshot().await;
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].status, "away");
        assert_eq!(presence[0].metadata["cursor"], json!([3, 4]));
        // Presence traffic never advances the authoritative version.
        assert_eq!(handle.version().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_prunes_and_announces_once() {
        let coordinator = coordinator_with(test_config()).await;
        let (_alice, mut alice_rx) = connect(&coordinator, "alice").await;
        let (bob, mut bob_rx) = connect(&coordinator, "bob").await;

        // Alice goes silent; bob stays chatty past alice's 60ms deadline.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let hb = envelope("h1", "heartbeat", "bob", json!({}));
        coordinator.handle_message(bob, &hb).await;
        let _ = bob_rx.try_recv();
        tokio::time::sleep(Duration::from_millis(30)).await;

        coordinator.maintenance_once().await;

        assert_eq!(coordinator.connection_count().await, 1);
        let notice = recv_frame(&mut bob_rx);
        assert_eq!(notice.kind, MessageType::Presence);
        assert_eq!(notice.user_id, "alice");
        assert_eq!(notice.data["status"], "disconnected");
        assert!(bob_rx.try_recv().is_err());

        // Alice's own channel saw nothing.
        assert!(alice_rx.try_recv().is_err());

        let handle = coordinator.sessions().get_session("table-1").await.unwrap();
        assert_eq!(handle.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_clean_disconnect_announces() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, _alice_rx) = connect(&coordinator, "alice").await;
        let (_bob, mut bob_rx) = connect(&coordinator, "bob").await;

        coordinator.disconnect(alice).await;
        coordinator.disconnect(alice).await;

        let notice = recv_frame(&mut bob_rx);
        assert_eq!(notice.data["status"], "disconnected");
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(coordinator.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_connection_suppresses_announcement() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice_a, _rx_a) = connect(&coordinator, "alice").await;
        let (_alice_b, _rx_b) = connect(&coordinator, "alice").await;
        let (_bob, mut bob_rx) = connect(&coordinator, "bob").await;

        coordinator.disconnect(alice_a).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_resubmits_own_actions_only() {
        let coordinator = coordinator_with(test_config()).await;
        let (alice, _alice_rx) = connect(&coordinator, "alice").await;
        let (_bob, mut bob_rx) = connect(&coordinator, "bob").await;

        let queued = json!({
            "actions": [
                {
                    "id": "q1",
                    "type": "move",
                    "userId": "alice",
                    "sessionId": "table-1",
                    "payload": {"resourceId": "tok1"},
                    "timestamp": Utc::now().to_rfc3339(),
                    "version": 0,
                },
                {
                    "id": "q2",
                    "type": "move",
                    "userId": "mallory",
                    "sessionId": "table-1",
                    "payload": {"resourceId": "tok2"},
                    "timestamp": Utc::now().to_rfc3339(),
                    "version": 0,
                },
            ]
        });
        let frame = envelope("r1", "sync_response", "alice", queued);
        coordinator.handle_message(alice, &frame).await;

        let relayed = recv_frame(&mut bob_rx);
        assert_eq!(relayed.id, "q1");
        assert_eq!(relayed.version, Some(1));
        assert_eq!(relayed.user_id, "alice");
        assert!(bob_rx.try_recv().is_err());

        let handle = coordinator.sessions().get_session("table-1").await.unwrap();
        assert_eq!(handle.version().await, 1);
    }
}
