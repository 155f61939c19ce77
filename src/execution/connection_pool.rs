//! # Connection Pool
//!
//! Tracks live connections by connection id and binds them to stable
//! logical ids (`agent-7`, `conductor`). At most one live connection holds a
//! logical id: a newer registration supersedes and closes the older one.
//!
//! Each connection owns a bounded outbound queue drained by its socket task;
//! senders wait at most `send_timeout` on a full queue before giving up, so a
//! slow peer applies backpressure without stalling the core loop forever.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::launcher::WorkerHandle;
use crate::config::{HeartbeatConfig, ServerConfig};
use crate::constants::metrics;
use crate::error::ConductorError;
use crate::logging::log_connection_operation;
use crate::messaging::{EndpointRole, HeartbeatPayload, Message, MessagePayload};
use crate::metrics::Metrics;

pub type ConnectionId = String;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionPoolError {
    #[error("Connection limit of {max} reached")]
    CapacityExceeded { max: usize },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("No live connection bound to {0}")]
    Unbound(String),

    #[error("Outbound queue for {connection_id} stayed full for {timeout_ms}ms")]
    Backpressure {
        connection_id: ConnectionId,
        timeout_ms: u64,
    },

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

pub type ConnectionPoolResult<T> = Result<T, ConnectionPoolError>;

impl From<ConnectionPoolError> for ConductorError {
    fn from(error: ConnectionPoolError) -> Self {
        match error {
            ConnectionPoolError::CapacityExceeded { .. } => {
                ConductorError::CapacityExceeded(error.to_string())
            }
            ConnectionPoolError::Backpressure { .. } => ConductorError::Timeout(error.to_string()),
            ConnectionPoolError::Unbound(_)
            | ConnectionPoolError::Closed(_)
            | ConnectionPoolError::UnknownConnection(_) => {
                ConductorError::ConnectionUnbound(error.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Peer closed the socket or a read/write failed
    Closed,
    /// No traffic within the heartbeat timeout
    Stale,
    /// Same logical id registered on a newer connection
    Superseded,
    Shutdown,
}

/// Lifecycle notifications for the server's core loop
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Connected {
        connection_id: ConnectionId,
    },
    Registered {
        connection_id: ConnectionId,
        logical_id: String,
        role: EndpointRole,
    },
    /// `logical_id` is set only when this connection released the binding
    Disconnected {
        connection_id: ConnectionId,
        logical_id: Option<String>,
        reason: DisconnectReason,
    },
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub logical_id: Option<String>,
    pub role: Option<EndpointRole>,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug)]
struct ConnectionSlot {
    info: ConnectionInfo,
    last_seen: Instant,
    outbound: mpsc::Sender<String>,
    close: Arc<Notify>,
}

/// What a socket task needs after its connection is admitted
#[derive(Debug)]
pub struct ConnectionRegistration {
    pub connection_id: ConnectionId,
    /// Frames to write to the socket, in order
    pub outbound: mpsc::Receiver<String>,
    /// Notified when the pool wants the socket closed
    pub close: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub conductor_id: String,
    pub max_connections: usize,
    pub outbound_queue_size: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(server: &ServerConfig, heartbeat: &HeartbeatConfig) -> Self {
        Self {
            conductor_id: server.conductor_id.clone(),
            max_connections: server.max_connections,
            outbound_queue_size: server.outbound_queue_size,
            send_timeout: server.send_timeout(),
            heartbeat_interval: heartbeat.interval(),
            heartbeat_timeout: heartbeat.timeout(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default(), &HeartbeatConfig::default())
    }
}

#[derive(Debug)]
pub struct ConnectionPool {
    settings: PoolSettings,
    connections: DashMap<ConnectionId, ConnectionSlot>,
    logical: DashMap<String, ConnectionId>,
    expected: DashMap<String, WorkerHandle>,
    events: broadcast::Sender<PoolEvent>,
    next_id: AtomicU64,
    metrics: Metrics,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, metrics: Metrics) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            connections: DashMap::new(),
            logical: DashMap::new(),
            expected: DashMap::new(),
            events,
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Admit a new socket and assign it a connection id
    pub fn add_connection(&self) -> ConnectionPoolResult<ConnectionRegistration> {
        if self.connections.len() >= self.settings.max_connections {
            warn!(
                max = self.settings.max_connections,
                "🚫 Rejecting connection, pool at capacity"
            );
            return Err(ConnectionPoolError::CapacityExceeded {
                max: self.settings.max_connections,
            });
        }

        let connection_id = format!("conn-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_queue_size.max(1));
        let close = Arc::new(Notify::new());
        let now = Utc::now();

        self.connections.insert(
            connection_id.clone(),
            ConnectionSlot {
                info: ConnectionInfo {
                    connection_id: connection_id.clone(),
                    logical_id: None,
                    role: None,
                    capabilities: Vec::new(),
                    connected_at: now,
                    last_heartbeat: now,
                },
                last_seen: Instant::now(),
                outbound: outbound_tx,
                close: close.clone(),
            },
        );

        log_connection_operation("connect", &connection_id, None, None);
        self.publish(PoolEvent::Connected {
            connection_id: connection_id.clone(),
        });

        Ok(ConnectionRegistration {
            connection_id,
            outbound: outbound_rx,
            close,
        })
    }

    /// Bind `logical_id` to `connection_id`, last writer wins
    ///
    /// Returns the superseded connection id, which has already been closed.
    pub fn register_logical_id(
        &self,
        connection_id: &str,
        logical_id: &str,
        role: EndpointRole,
        capabilities: Vec<String>,
    ) -> ConnectionPoolResult<Option<ConnectionId>> {
        let previous_logical = {
            let mut slot = self
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| ConnectionPoolError::UnknownConnection(connection_id.to_string()))?;
            let previous = slot.info.logical_id.replace(logical_id.to_string());
            slot.info.role = Some(role);
            slot.info.capabilities = capabilities;
            slot.last_seen = Instant::now();
            previous
        };

        // Connection switched identity: drop its old binding
        if let Some(old) = previous_logical.filter(|old| old != logical_id) {
            self.logical.remove_if(&old, |_, bound| bound == connection_id);
        }

        let superseded = self
            .logical
            .insert(logical_id.to_string(), connection_id.to_string())
            .filter(|previous| previous != connection_id);

        if let Some(stale) = &superseded {
            info!(
                logical_id = logical_id,
                old_connection = %stale,
                new_connection = connection_id,
                "🔀 Logical id re-registered, closing superseded connection"
            );
            self.remove_connection(stale, DisconnectReason::Superseded);
        }

        if self.expected.remove(logical_id).is_some() {
            debug!(logical_id = logical_id, "Launched worker checked in");
        }

        log_connection_operation("register", connection_id, Some(logical_id), None);
        self.publish(PoolEvent::Registered {
            connection_id: connection_id.to_string(),
            logical_id: logical_id.to_string(),
            role,
        });
        Ok(superseded)
    }

    /// Drop a connection; releases its logical binding if it still owns it
    pub fn remove_connection(&self, connection_id: &str, reason: DisconnectReason) -> Option<String> {
        let (_, slot) = self.connections.remove(connection_id)?;
        slot.close.notify_one();

        let released = slot.info.logical_id.filter(|logical_id| {
            self.logical
                .remove_if(logical_id, |_, bound| bound == connection_id)
                .is_some()
        });

        log_connection_operation(
            "disconnect",
            connection_id,
            released.as_deref(),
            Some(&format!("{reason:?}")),
        );
        self.publish(PoolEvent::Disconnected {
            connection_id: connection_id.to_string(),
            logical_id: released.clone(),
            reason,
        });
        released
    }

    /// Record inbound traffic from a connection
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut slot) = self.connections.get_mut(connection_id) {
            slot.last_seen = Instant::now();
            slot.info.last_heartbeat = Utc::now();
        }
    }

    pub async fn send(&self, connection_id: &str, frame: String) -> ConnectionPoolResult<()> {
        let sender = self
            .connections
            .get(connection_id)
            .map(|slot| slot.outbound.clone())
            .ok_or_else(|| ConnectionPoolError::UnknownConnection(connection_id.to_string()))?;

        match sender.send_timeout(frame, self.settings.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(connection_id = connection_id, "⏳ Outbound queue full");
                Err(ConnectionPoolError::Backpressure {
                    connection_id: connection_id.to_string(),
                    timeout_ms: self.settings.send_timeout.as_millis() as u64,
                })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(ConnectionPoolError::Closed(connection_id.to_string()))
            }
        }
    }

    /// Deliver to whichever connection currently holds `logical_id`
    pub async fn send_to_logical(&self, logical_id: &str, frame: String) -> ConnectionPoolResult<()> {
        let connection_id = self
            .connection_for(logical_id)
            .ok_or_else(|| ConnectionPoolError::Unbound(logical_id.to_string()))?;
        self.send(&connection_id, frame).await?;
        self.metrics.increment(metrics::MESSAGES_SENT);
        Ok(())
    }

    pub fn is_bound(&self, logical_id: &str) -> bool {
        self.logical.contains_key(logical_id)
    }

    pub fn connection_for(&self, logical_id: &str) -> Option<ConnectionId> {
        self.logical.get(logical_id).map(|entry| entry.value().clone())
    }

    pub fn logical_id_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|slot| slot.info.logical_id.clone())
    }

    pub fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .get(connection_id)
            .map(|slot| slot.info.clone())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn bound_count(&self) -> usize {
        self.logical.len()
    }

    /// Remember a launched worker until it registers
    pub fn expect(&self, handle: WorkerHandle) {
        self.expected.insert(handle.agent_id.clone(), handle);
    }

    pub fn expected(&self, logical_id: &str) -> Option<WorkerHandle> {
        self.expected
            .get(logical_id)
            .map(|entry| entry.value().clone())
    }

    /// Close every connection silent past the heartbeat timeout
    pub fn sweep_stale(&self) -> Vec<ConnectionId> {
        let timeout = self.settings.heartbeat_timeout;
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|slot| slot.last_seen.elapsed() > timeout)
            .map(|slot| slot.key().clone())
            .collect();

        for connection_id in &stale {
            warn!(connection_id = %connection_id, "💔 Heartbeat timeout, closing connection");
            self.remove_connection(connection_id, DisconnectReason::Stale);
        }
        stale
    }

    /// Queue a `HEARTBEAT` ping on every connection
    pub async fn ping_all(&self) -> usize {
        let targets: Vec<(ConnectionId, String)> = self
            .connections
            .iter()
            .map(|slot| {
                let recipient = slot.info.logical_id.clone().unwrap_or_else(|| slot.key().clone());
                (slot.key().clone(), recipient)
            })
            .collect();

        let mut sent = 0;
        for (connection_id, recipient) in targets {
            let ping = Message::new(
                self.settings.conductor_id.as_str(),
                recipient,
                MessagePayload::Heartbeat(HeartbeatPayload {
                    status: Some("ping".to_string()),
                    load: None,
                }),
            );
            let Ok(frame) = ping.to_json_line() else {
                continue;
            };
            match self.send(&connection_id, frame).await {
                Ok(()) => sent += 1,
                Err(error) => debug!(connection_id = %connection_id, error = %error, "Ping not queued"),
            }
        }
        sent
    }

    /// Ping on every interval tick and sweep stale connections
    pub fn spawn_heartbeat_loop(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.settings.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.sweep_stale();
                        pool.ping_all().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("💓 Heartbeat loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Close all connections; safe to call repeatedly
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|slot| slot.key().clone())
            .collect();
        for connection_id in &ids {
            self.remove_connection(connection_id, reason);
        }
        ids.len()
    }

    pub fn dispose(&self) {
        self.close_all(DisconnectReason::Shutdown);
        self.logical.clear();
        self.expected.clear();
    }

    fn publish(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
