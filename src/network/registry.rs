//! Connection Registry
//!
//! Maps live transport connections to their verified user and session
//! identity. One user may hold several connections (two browser tabs, a
//! phone and a laptop); each is tracked separately and liveness is judged
//! per connection. The registry also owns each connection's sync_request
//! rate limiter so abusive resync loops are contained at the edge.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::core::ids::{ConnectionId, SessionId, UserId};
use crate::session::manager::SyncConfig;

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Registered; no frame received yet.
    Connecting,
    /// Recently heard from.
    Connected,
    /// Silent past half the heartbeat timeout; presumed struggling.
    Reconnecting,
    /// Removed; kept only in final snapshots handed to the sweeper.
    Disconnected,
}

struct Connection {
    user_id: UserId,
    session_id: SessionId,
    status: ConnectionStatus,
    connected_at: DateTime<Utc>,
    last_seen_at: Instant,
    latency_ms: Option<i64>,
    outbound: mpsc::Sender<String>,
    sync_limiter: DefaultDirectRateLimiter,
}

/// Copyable view of one connection, as exposed to callers and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Verified user.
    pub user_id: UserId,
    /// Registered session.
    pub session_id: SessionId,
    /// Lifecycle status at snapshot time.
    pub status: ConnectionStatus,
    /// When the connection registered.
    pub connected_at: DateTime<Utc>,
    /// Last measured one-way latency, if any heartbeat carried one.
    pub latency_ms: Option<i64>,
}

/// Result of one liveness sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Connections removed for exceeding the heartbeat timeout.
    pub expired: Vec<ConnectionSnapshot>,
    /// Connections newly marked reconnecting this sweep.
    pub reconnecting: Vec<ConnectionId>,
}

/// All registered connections, keyed by connection id.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
    heartbeat_timeout: Duration,
    sync_quota: Quota,
}

impl ConnectionRegistry {
    /// Registry using `config` for timeouts and rate limits.
    pub fn new(config: &SyncConfig) -> Self {
        let per_second =
            NonZeroU32::new(config.sync_request_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.sync_request_burst).unwrap_or(NonZeroU32::MIN);
        Self {
            connections: RwLock::new(BTreeMap::new()),
            heartbeat_timeout: config.heartbeat_timeout,
            sync_quota: Quota::per_second(per_second).allow_burst(burst),
        }
    }

    /// Register a verified connection. It starts `Connecting`; the first
    /// inbound frame moves it to `Connected`.
    pub async fn insert(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        session_id: &str,
        outbound: mpsc::Sender<String>,
    ) {
        let connection = Connection {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            status: ConnectionStatus::Connecting,
            connected_at: Utc::now(),
            last_seen_at: Instant::now(),
            latency_ms: None,
            outbound,
            sync_limiter: RateLimiter::direct(self.sync_quota),
        };
        self.connections
            .write()
            .await
            .insert(connection_id, connection);
    }

    /// Remove a connection, returning its final snapshot.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        let mut connections = self.connections.write().await;
        let conn = connections.remove(&connection_id)?;
        Some(ConnectionSnapshot {
            connection_id,
            user_id: conn.user_id,
            session_id: conn.session_id,
            status: ConnectionStatus::Disconnected,
            connected_at: conn.connected_at,
            latency_ms: conn.latency_ms,
        })
    }

    /// Whether `connection_id` is registered.
    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    /// Verified identity of `connection_id`.
    pub async fn identity(&self, connection_id: ConnectionId) -> Option<(UserId, SessionId)> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| (c.user_id.clone(), c.session_id.clone()))
    }

    /// Note inbound traffic: refresh the liveness clock and revive a
    /// reconnecting connection.
    pub async fn touch(&self, connection_id: ConnectionId) {
        if let Some(conn) = self.connections.write().await.get_mut(&connection_id) {
            conn.last_seen_at = Instant::now();
            if conn.status == ConnectionStatus::Reconnecting {
                debug!(connection_id = %connection_id, "connection recovered");
            }
            conn.status = ConnectionStatus::Connected;
        }
    }

    /// Record a heartbeat and its latency estimate.
    pub async fn record_heartbeat(&self, connection_id: ConnectionId, latency_ms: Option<i64>) {
        if let Some(conn) = self.connections.write().await.get_mut(&connection_id) {
            conn.last_seen_at = Instant::now();
            conn.status = ConnectionStatus::Connected;
            if latency_ms.is_some() {
                conn.latency_ms = latency_ms;
            }
        }
    }

    /// Lifecycle status of `connection_id`.
    pub async fn status(&self, connection_id: ConnectionId) -> Option<ConnectionStatus> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.status)
    }

    /// Snapshot of `connection_id`.
    pub async fn snapshot(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.connections.read().await.get(&connection_id).map(|c| {
            ConnectionSnapshot {
                connection_id,
                user_id: c.user_id.clone(),
                session_id: c.session_id.clone(),
                status: c.status,
                connected_at: c.connected_at,
                latency_ms: c.latency_ms,
            }
        })
    }

    /// Snapshots of every connection registered to `session_id`.
    pub async fn session_connections(&self, session_id: &str) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.session_id == session_id)
            .map(|(id, c)| ConnectionSnapshot {
                connection_id: *id,
                user_id: c.user_id.clone(),
                session_id: c.session_id.clone(),
                status: c.status,
                connected_at: c.connected_at,
                latency_ms: c.latency_ms,
            })
            .collect()
    }

    /// How many connections `user_id` holds within `session_id`.
    pub async fn user_connection_count(&self, session_id: &str, user_id: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.session_id == session_id && c.user_id == user_id)
            .count()
    }

    /// Total registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Outbound channel of `connection_id`, for direct replies.
    pub async fn outbound(&self, connection_id: ConnectionId) -> Option<mpsc::Sender<String>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.outbound.clone())
    }

    /// Whether `connection_id` may issue a sync_request right now.
    pub async fn check_sync_rate(&self, connection_id: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.sync_limiter.check().is_ok())
            .unwrap_or(false)
    }

    /// One liveness pass: connections silent past the full timeout are
    /// removed and reported expired; ones past half the timeout are marked
    /// reconnecting.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut connections = self.connections.write().await;
        let half_timeout = self.heartbeat_timeout / 2;

        let expired_ids: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, c)| c.last_seen_at.elapsed() >= self.heartbeat_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired_ids {
            if let Some(conn) = connections.remove(&id) {
                report.expired.push(ConnectionSnapshot {
                    connection_id: id,
                    user_id: conn.user_id,
                    session_id: conn.session_id,
                    status: ConnectionStatus::Disconnected,
                    connected_at: conn.connected_at,
                    latency_ms: conn.latency_ms,
                });
            }
        }

        for (id, conn) in connections.iter_mut() {
            if conn.status != ConnectionStatus::Reconnecting
                && conn.last_seen_at.elapsed() >= half_timeout
            {
                conn.status = ConnectionStatus::Reconnecting;
                report.reconnecting.push(*id);
            }
        }
        report
    }
}
