//! # Orchestration Server
//!
//! Owns the listening socket and wires the connection pool, message router,
//! task queue and event bus together.
//!
//! Socket tasks only move bytes: each reads newline-delimited frames and
//! forwards them to a single core loop, and writes whatever the pool queues
//! for its connection. The core loop handles every frame, pool event and
//! debounced status update in turn, so all scheduling state is mutated from
//! one logical thread.
//!
//! ```rust,no_run
//! use conductor_core::config::ConductorConfig;
//! use conductor_core::execution::OrchestrationServer;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = OrchestrationServer::new(Arc::new(ConductorConfig::default()));
//! let address = server.start().await?;
//! println!("conductor listening on {address}");
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use super::connection_pool::{ConnectionPool, DisconnectReason, PoolEvent, PoolSettings};
use super::launcher::{WorkerHandle, WorkerLauncher};
use crate::config::ConductorConfig;
use crate::constants::events;
use crate::error::{ConductorError, Result};
use crate::events::{Debouncer, EventBus};
use crate::logging::log_error;
use crate::messaging::{
    AssignTaskPayload, ConnectionEstablishedPayload, EndpointRole, InMemoryMessageStore, Message,
    MessagePayload, MessageRouter, MessageStore, MessageType, RouteOutcome, TaskCancelledPayload,
    DELIVERY_BREAKER, MAX_FRAME_BYTES,
};
use crate::metrics::Metrics;
use crate::models::{NewTask, TaskId};
use crate::orchestration::{CompletionHandle, QueueEffect, QueueStats, TaskQueue};
use crate::resilience::{CircuitBreakerManager, RetryManager};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum OrchestrationServerError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Failed to bind to address {address}: {error}")]
    BindFailed { address: String, error: String },

    #[error("Message store unavailable at startup: {0}")]
    StoreUnavailable(String),
}

impl From<OrchestrationServerError> for ConductorError {
    fn from(error: OrchestrationServerError) -> Self {
        match error {
            OrchestrationServerError::StoreUnavailable(_) => {
                ConductorError::Persistence(error.to_string())
            }
            _ => ConductorError::Internal(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub active_connections: usize,
    pub bound_endpoints: usize,
    pub queue: QueueStats,
}

/// One line read from a socket
#[derive(Debug)]
struct InboundFrame {
    connection_id: String,
    line: String,
}

type StatusUpdate = (&'static str, Value);

/// Shared state reachable from the core loop and socket tasks
#[derive(Debug)]
struct ServerCore {
    config: Arc<ConductorConfig>,
    pool: Arc<ConnectionPool>,
    router: Arc<MessageRouter>,
    queue: Arc<Mutex<TaskQueue>>,
    bus: Arc<EventBus>,
    debouncer: Debouncer<StatusUpdate>,
    debounced: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, StatusUpdate)>>,
}

#[derive(Debug, Default)]
struct ServerState {
    running: bool,
    local_addr: Option<SocketAddr>,
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct OrchestrationServer {
    core: Arc<ServerCore>,
    breakers: Arc<CircuitBreakerManager>,
    state: tokio::sync::Mutex<ServerState>,
}

impl OrchestrationServer {
    /// Server with an in-memory message store and no metrics sink
    pub fn new(config: Arc<ConductorConfig>) -> Self {
        let store = Arc::new(InMemoryMessageStore::from_config(&config.history));
        Self::with_collaborators(config, store, Metrics::noop())
    }

    pub fn with_collaborators(
        config: Arc<ConductorConfig>,
        store: Arc<dyn MessageStore>,
        metrics: Metrics,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.to_resilience_config(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            PoolSettings::from_config(&config.server, &config.heartbeat),
            metrics.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            config.server.conductor_id.clone(),
            config.history.retention_limit,
            pool.clone(),
            store,
            Arc::new(crate::resilience::CircuitBreaker::new(
                DELIVERY_BREAKER,
                config.circuit_breaker.to_resilience_config(),
            )),
            RetryManager::new(DELIVERY_BREAKER, config.retry.to_resilience_config()),
            metrics.clone(),
        ));
        let queue = Arc::new(Mutex::new(TaskQueue::new(
            config.scheduler.clone(),
            metrics,
        )));
        let bus = Arc::new(EventBus::new(config.events.clone(), breakers.clone()));
        let (debouncer, debounced) = Debouncer::new(config.events.debounce());

        Self {
            core: Arc::new(ServerCore {
                config,
                pool,
                router,
                queue,
                bus,
                debouncer,
                debounced: tokio::sync::Mutex::new(debounced),
            }),
            breakers,
            state: tokio::sync::Mutex::new(ServerState::default()),
        }
    }

    /// Bind the listener and spawn the accept, core and heartbeat loops
    ///
    /// Returns the bound address. An unreachable message store or a failed
    /// bind aborts startup.
    pub async fn start(&self) -> std::result::Result<SocketAddr, OrchestrationServerError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(OrchestrationServerError::AlreadyRunning);
        }

        self.core
            .router
            .store()
            .initialize()
            .await
            .map_err(|e| OrchestrationServerError::StoreUnavailable(e.to_string()))?;

        let address = self.core.config.server.bind_address.clone();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            OrchestrationServerError::BindFailed {
                address: address.clone(),
                error: e.to_string(),
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| OrchestrationServerError::BindFailed {
                address: address.clone(),
                error: e.to_string(),
            })?;

        let (shutdown_tx, _) = broadcast::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let pool_events = self.core.pool.subscribe();

        let core = Arc::clone(&self.core);
        let core_shutdown = shutdown_tx.subscribe();
        state.tasks.push(tokio::spawn(async move {
            core.run(inbound_rx, pool_events, core_shutdown).await;
        }));

        let core = Arc::clone(&self.core);
        let accept_shutdown = shutdown_tx.clone();
        state.tasks.push(tokio::spawn(async move {
            core.accept_connections(listener, inbound_tx, accept_shutdown)
                .await;
        }));

        state
            .tasks
            .push(self.core.pool.spawn_heartbeat_loop(shutdown_tx.subscribe()));

        state.running = true;
        state.local_addr = Some(local_addr);
        state.shutdown = Some(shutdown_tx);

        info!(
            address = %local_addr,
            conductor_id = %self.core.config.server.conductor_id,
            "🚀 Orchestration server listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait for the loops to exit
    ///
    /// Calling this on a stopped server is a no-op.
    pub async fn stop(&self) -> std::result::Result<(), OrchestrationServerError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(());
        }
        info!("🛑 Stopping orchestration server");

        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.core.pool.close_all(DisconnectReason::Shutdown);
        self.core.debouncer.dispose();

        let grace = self.core.config.server.graceful_shutdown_timeout();
        for mut task in state.tasks.drain(..) {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("Server loop did not exit within the grace period, aborting");
                task.abort();
            }
        }

        state.running = false;
        state.local_addr = None;
        info!("Orchestration server stopped");
        Ok(())
    }

    /// Stop and release every component; safe to call repeatedly
    pub async fn dispose(&self) -> std::result::Result<(), OrchestrationServerError> {
        self.stop().await?;
        self.core.queue.lock().dispose();
        self.core.bus.dispose();
        self.core.pool.dispose();
        self.breakers.clear().await;
        Ok(())
    }

    pub async fn get_status(&self) -> ServerStatus {
        let state = self.state.lock().await;
        let queue = self.core.queue.lock().stats();
        ServerStatus {
            running: state.running,
            port: state.local_addr.map(|addr| addr.port()),
            active_connections: self.core.pool.active_connections(),
            bound_endpoints: self.core.pool.bound_count(),
            queue,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.local_addr
    }

    /// Submit a task from inside the conductor process
    pub async fn submit_task(&self, task: NewTask) -> Result<TaskId> {
        let submitted = self.core.queue.lock().submit(task);
        let task_id = submitted?;
        self.core.apply_effects().await;
        Ok(task_id)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let cancelled = self.core.queue.lock().cancel_task(task_id);
        cancelled?;
        self.core.apply_effects().await;
        Ok(())
    }

    pub fn watch_completion(&self, task_id: &str) -> Result<CompletionHandle> {
        self.core.queue.lock().watch_completion(task_id)
    }

    /// Ask `launcher` for a worker and expect it to register as `agent_id`
    pub async fn launch_worker(
        &self,
        launcher: &dyn WorkerLauncher,
        agent_id: &str,
        role: EndpointRole,
    ) -> Result<WorkerHandle> {
        let handle = launcher.launch(agent_id, role).await?;
        self.core.pool.expect(handle.clone());
        Ok(handle)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.core.pool
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.core.router
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.core.bus
    }

    pub fn task_queue(&self) -> &Arc<Mutex<TaskQueue>> {
        &self.core.queue
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }
}

impl ServerCore {
    async fn accept_connections(
        self: Arc<Self>,
        listener: TcpListener,
        inbound: mpsc::Sender<InboundFrame>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let core = Arc::clone(&self);
                        let inbound = inbound.clone();
                        let shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            core.serve_connection(stream, peer, inbound, shutdown).await;
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown_rx.recv() => {
                    debug!("Accept loop shutting down");
                    break;
                }
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        inbound: mpsc::Sender<InboundFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let registration = match self.pool.add_connection() {
            Ok(registration) => registration,
            Err(e) => {
                let refusal = Message::system_error(
                    &self.config.server.conductor_id,
                    "unknown",
                    &ConductorError::from(e),
                    None,
                );
                if let Ok(frame) = refusal.to_json_line() {
                    let _ = stream.write_all(frame.as_bytes()).await;
                }
                return;
            }
        };
        let connection_id = registration.connection_id;
        let mut outbound = registration.outbound;
        let close = registration.close;
        debug!(connection_id = %connection_id, peer = %peer, "🔌 Connection accepted");

        let established = Message::new(
            self.config.server.conductor_id.as_str(),
            connection_id.as_str(),
            MessagePayload::ConnectionEstablished(ConnectionEstablishedPayload {
                connection_id: connection_id.clone(),
                conductor_id: self.config.server.conductor_id.clone(),
            }),
        );
        match established.to_json_line() {
            Ok(frame) => {
                if let Err(e) = self.pool.send(&connection_id, frame).await {
                    warn!(connection_id = %connection_id, error = %e, "Could not greet connection");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode greeting"),
        }

        let (reader, mut writer) = stream.into_split();
        // Bounded so a peer that never sends a newline cannot grow the buffer
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let frame = InboundFrame { connection_id: connection_id.clone(), line };
                        if inbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(
                            connection_id = %connection_id,
                            limit = MAX_FRAME_BYTES,
                            "🚫 Oversized frame discarded"
                        );
                        let refusal = self.oversized_frame_response(&connection_id);
                        match refusal.to_json_line() {
                            Ok(frame) => {
                                if let Err(e) = writer.write_all(frame.as_bytes()).await {
                                    warn!(connection_id = %connection_id, error = %e, "Write failed");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Could not encode frame refusal"),
                        }
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        warn!(connection_id = %connection_id, error = %e, "Read failed");
                        break;
                    }
                    None => {
                        debug!(connection_id = %connection_id, "Peer closed connection");
                        break;
                    }
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = writer.write_all(frame.as_bytes()).await {
                            warn!(connection_id = %connection_id, error = %e, "Write failed");
                            break;
                        }
                    }
                    None => break,
                },
                _ = close.notified() => break,
                _ = shutdown.recv() => break,
            }
        }

        let _ = writer.shutdown().await;
        self.pool
            .remove_connection(&connection_id, DisconnectReason::Closed);
    }

    /// `SYSTEM_ERROR` for a line longer than the frame limit
    fn oversized_frame_response(&self, connection_id: &str) -> Message {
        let recipient = self
            .pool
            .logical_id_of(connection_id)
            .unwrap_or_else(|| "unknown".to_string());
        Message::system_error(
            &self.config.server.conductor_id,
            &recipient,
            &ConductorError::validation_field(
                format!("Frame exceeds the {MAX_FRAME_BYTES} byte limit"),
                "frame",
            ),
            None,
        )
    }

    /// The single logical thread that mutates scheduling state
    async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundFrame>,
        mut pool_events: broadcast::Receiver<PoolEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut debounced = self.debounced.lock().await;
        loop {
            tokio::select! {
                Some(frame) = inbound.recv() => {
                    self.handle_frame(&frame.connection_id, &frame.line).await;
                }
                event = pool_events.recv() => match event {
                    Ok(event) => self.handle_pool_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Core loop lagged behind pool events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some((_key, (topic, payload))) = debounced.recv() => {
                    self.publish(topic, payload).await;
                }
                _ = shutdown.recv() => {
                    debug!("Core loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_frame(&self, connection_id: &str, line: &str) {
        self.pool.touch(connection_id);

        let message = match self.router.validate(line) {
            Ok(message) => message,
            Err(response) => {
                self.respond(connection_id, response).await;
                return;
            }
        };

        if let Err(error) = self.check_identity(connection_id, &message) {
            let response = self.router.error_response(&message, &error);
            self.respond(connection_id, response).await;
            return;
        }

        match self.router.route(message).await {
            RouteOutcome::Local(message) => self.handle_local(connection_id, message).await,
            RouteOutcome::Rejected(response) => self.respond(connection_id, response).await,
            RouteOutcome::Delivered { .. } | RouteOutcome::Queued { .. } => {}
        }
        self.apply_effects().await;
    }

    /// Bound connections speak only as their logical id; unbound ones may
    /// only register, ping or submit work
    fn check_identity(&self, connection_id: &str, message: &Message) -> Result<()> {
        match self.pool.logical_id_of(connection_id) {
            Some(logical_id) if logical_id != message.from => Err(ConductorError::validation_field(
                format!(
                    "Connection is registered as {logical_id} but sent as {}",
                    message.from
                ),
                "from",
            )),
            Some(_) => Ok(()),
            None => match message.message_type {
                MessageType::AgentReady | MessageType::Heartbeat | MessageType::SubmitTask => {
                    Ok(())
                }
                other => Err(ConductorError::validation_field(
                    format!("{other} requires a prior AGENT_READY"),
                    "type",
                )),
            },
        }
    }

    async fn handle_local(&self, connection_id: &str, message: Message) {
        let outcome = match &message.payload {
            MessagePayload::AgentReady(ready) => {
                match self
                    .register(connection_id, &message, ready.role, &ready.capabilities)
                    .await
                {
                    Ok(()) => return,
                    Err(error) => Err(error),
                }
            }
            MessagePayload::TaskAccepted(accepted) => {
                let result = self
                    .queue
                    .lock()
                    .task_accepted(&accepted.task_id, &message.from);
                result.map(|()| None)
            }
            MessagePayload::TaskProgress(progress) => {
                self.debouncer.push(
                    format!("progress:{}", progress.task_id),
                    (
                        events::TASK_PROGRESS,
                        json!({
                            "taskId": progress.task_id,
                            "workerId": message.from,
                            "progress": progress.progress,
                            "message": progress.message,
                        }),
                    ),
                );
                Ok(None)
            }
            MessagePayload::TaskComplete(complete) => {
                let result = self.queue.lock().complete_task(
                    &complete.task_id,
                    &message.from,
                    complete.result.clone(),
                );
                result.map(|_| Some(complete.task_id.clone()))
            }
            MessagePayload::TaskFailed(failed) => {
                let result = self.queue.lock().fail_task(
                    &failed.task_id,
                    &message.from,
                    &failed.error,
                    failed.retryable,
                );
                result.map(|_| Some(failed.task_id.clone()))
            }
            MessagePayload::TaskCancelled(cancelled) => {
                self.worker_cancelled(&message.from, &cancelled.task_id)
                    .map(|()| Some(cancelled.task_id.clone()))
            }
            MessagePayload::SystemAck(ack) => {
                match self.router.acknowledge(&message.from, &ack.ack_id).await {
                    Ok(_) => return,
                    Err(error) => Err(error),
                }
            }
            MessagePayload::SystemError(report) => {
                warn!(
                    from = %message.from,
                    code = %report.code,
                    error = %report.error,
                    "Endpoint reported an error"
                );
                return;
            }
            MessagePayload::Heartbeat(beat) => {
                self.debouncer.push(
                    format!("status:{}", message.from),
                    (
                        events::AGENT_STATUS,
                        json!({
                            "logicalId": message.from,
                            "status": beat.status,
                            "load": beat.load,
                        }),
                    ),
                );
                return;
            }
            MessagePayload::SubmitTask(request) => {
                let result = self.queue.lock().submit(request.clone());
                result.map(Some)
            }
            MessagePayload::ConnectionEstablished(_) | MessagePayload::AssignTask(_) => {
                Err(ConductorError::validation_field(
                    format!("{} is not accepted by the conductor", message.message_type),
                    "type",
                ))
            }
        };

        let response = match outcome {
            Ok(task_id) => Message::ack(
                &self.config.server.conductor_id,
                &message.from,
                &message.id,
                task_id,
            ),
            Err(error) => {
                debug!(message_id = %message.id, error = %error, "Local handling failed");
                self.router.error_response(&message, &error)
            }
        };
        self.respond(connection_id, response).await;
    }

    async fn register(
        &self,
        connection_id: &str,
        message: &Message,
        role: EndpointRole,
        capabilities: &[String],
    ) -> Result<()> {
        let logical_id = message.from.as_str();
        self.pool
            .register_logical_id(connection_id, logical_id, role, capabilities.to_vec())?;

        // Replay first so the registration ack is not sent twice
        if let Err(error) = self.router.replay(logical_id).await {
            log_error("server", "replay", &error.to_string(), Some(logical_id));
        }

        let ack = Message::ack(
            &self.config.server.conductor_id,
            logical_id,
            &message.id,
            None,
        );
        self.respond(connection_id, ack).await;

        self.publish(
            events::AGENT_REGISTERED,
            json!({
                "logicalId": logical_id,
                "connectionId": connection_id,
                "role": role,
                "capabilities": capabilities,
            }),
        )
        .await;

        if role == EndpointRole::Agent {
            let assigned = self
                .queue
                .lock()
                .worker_available(logical_id, capabilities.iter().cloned());
            debug!(logical_id = logical_id, assigned, "Worker available");
        }
        Ok(())
    }

    /// An agent gave up on its task; the conductor confirms with `TASK_CANCELLED`
    fn worker_cancelled(&self, worker_id: &str, task_id: &str) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.assigned_task(worker_id).map(String::as_str) != Some(task_id) {
            return Err(ConductorError::validation_field(
                format!("Task {task_id} is not assigned to {worker_id}"),
                "taskId",
            ));
        }
        queue.cancel_task(task_id)
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Connected { connection_id } => {
                self.publish(
                    events::AGENT_CONNECTED,
                    json!({ "connectionId": connection_id }),
                )
                .await;
            }
            PoolEvent::Registered { .. } => {}
            PoolEvent::Disconnected {
                connection_id,
                logical_id,
                reason,
            } => {
                // Superseded connections no longer own a logical id
                let Some(logical_id) = logical_id else {
                    return;
                };
                // The agent already came back on a newer connection
                if self
                    .pool
                    .connection_for(&logical_id)
                    .is_some_and(|current| current != connection_id)
                {
                    debug!(
                        logical_id = %logical_id,
                        connection_id = %connection_id,
                        "Ignoring disconnect of a replaced connection"
                    );
                    return;
                }
                let lost_task = self.queue.lock().worker_lost(&logical_id);
                self.publish(
                    events::AGENT_DISCONNECTED,
                    json!({
                        "logicalId": logical_id,
                        "connectionId": connection_id,
                        "reason": reason,
                        "taskId": lost_task,
                    }),
                )
                .await;
                self.apply_effects().await;
            }
        }
    }

    /// Carry out everything the task queue asked for, until it stops asking
    async fn apply_effects(&self) {
        loop {
            let effects = self.queue.lock().drain_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                match effect {
                    QueueEffect::Assign(assignment) => {
                        let worker_id = assignment.worker_id.clone();
                        let task = assignment.task;
                        let message = Message::new(
                            self.config.server.conductor_id.as_str(),
                            worker_id.as_str(),
                            MessagePayload::AssignTask(AssignTaskPayload {
                                task_id: task.id.clone(),
                                title: task.title.clone(),
                                description: task.description.clone(),
                                priority: task.base_priority(),
                                required_capabilities: task.required_capabilities.clone(),
                                attempt: task.attempts,
                                timeout_ms: self.config.scheduler.subtask_timeout_ms,
                            }),
                        );
                        if let Err(error) = self.router.send_required(&message).await {
                            warn!(
                                task_id = %task.id,
                                worker_id = %worker_id,
                                error = %error,
                                "📭 Assignment undeliverable, releasing worker"
                            );
                            self.queue.lock().worker_lost(&worker_id);
                        }
                    }
                    QueueEffect::Cancel { task_id, worker_id } => {
                        let notice = Message::new(
                            self.config.server.conductor_id.as_str(),
                            worker_id.as_str(),
                            MessagePayload::TaskCancelled(TaskCancelledPayload {
                                task_id: task_id.clone(),
                                reason: Some("Cancelled by conductor".to_string()),
                            }),
                        );
                        if let Err(error) = self.router.send(&notice).await {
                            log_error("server", "cancel", &error.to_string(), Some(&task_id));
                        }
                    }
                    QueueEffect::Event { topic, payload } => self.publish(topic, payload).await,
                }
            }
        }
    }

    /// Answer the endpoint behind `connection_id`
    ///
    /// Replies to a bound sender go through the router so they are persisted;
    /// anything else is written straight to the connection.
    async fn respond(&self, connection_id: &str, response: Message) {
        let bound = self.pool.logical_id_of(connection_id);
        let result = if bound.as_deref() == Some(response.to.as_str()) {
            self.router.send(&response).await
        } else {
            match response.to_json_line() {
                Ok(frame) => self
                    .pool
                    .send(connection_id, frame)
                    .await
                    .map_err(ConductorError::from),
                Err(error) => Err(error.into()),
            }
        };
        if let Err(error) = result {
            log_error("server", "respond", &error.to_string(), Some(connection_id));
        }
    }

    async fn publish(&self, topic: &'static str, payload: Value) {
        if let Err(error) = self.bus.publish(topic, payload).await {
            debug!(topic = topic, error = %error, "Event not published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::launcher::ExternalLauncher;
    use crate::models::TaskPriority;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn config() -> Arc<ConductorConfig> {
        let mut config = ConductorConfig::default();
        config.server.bind_address = "127.0.0.1:0".to_string();
        config.server.graceful_shutdown_timeout_ms = 200;
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let server = OrchestrationServer::new(config());
        assert!(!server.is_running().await);

        let address = server.start().await.unwrap();
        let status = server.get_status().await;
        assert!(status.running);
        assert_eq!(status.port, Some(address.port()));
        assert_eq!(status.active_connections, 0);

        assert!(matches!(
            server.start().await,
            Err(OrchestrationServerError::AlreadyRunning)
        ));

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        let status = server.get_status().await;
        assert!(!status.running);
        assert_eq!(status.port, None);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let first = OrchestrationServer::new(config());
        let address = first.start().await.unwrap();

        let mut taken = (*config()).clone();
        taken.server.bind_address = address.to_string();
        let second = OrchestrationServer::new(Arc::new(taken));
        assert!(matches!(
            second.start().await,
            Err(OrchestrationServerError::BindFailed { .. })
        ));
        assert!(!second.is_running().await);
        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_greets_new_connections() {
        let server = OrchestrationServer::new(config());
        let address = server.start().await.unwrap();

        let stream = TcpStream::connect(address).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let greeting = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&greeting).unwrap();
        assert_eq!(value["type"], "CONNECTION_ESTABLISHED");
        assert_eq!(value["from"], "conductor");

        server.dispose().await.unwrap();
        server.dispose().await.unwrap();
        assert_eq!(server.get_status().await.active_connections, 0);
    }

    #[tokio::test]
    async fn test_submit_without_workers_stays_queued() {
        let server = OrchestrationServer::new(config());
        let task_id = server
            .submit_task(NewTask::new("index repository").with_priority(TaskPriority::High))
            .await
            .unwrap();

        let status = server.get_status().await;
        assert_eq!(status.queue.queued_ready, 1);
        assert!(server.watch_completion(&task_id).is_ok());

        server.cancel_task(&task_id).await.unwrap();
        assert_eq!(server.get_status().await.queue.cancelled, 1);
    }

    #[tokio::test]
    async fn test_launch_worker_records_expectation() {
        let server = OrchestrationServer::new(config());
        let handle = server
            .launch_worker(&ExternalLauncher, "agent-4", EndpointRole::Agent)
            .await
            .unwrap();
        assert_eq!(handle.agent_id, "agent-4");
        assert!(server.pool().expected("agent-4").is_some());
    }

    #[tokio::test]
    async fn test_disconnect_of_replaced_connection_keeps_agent_working() {
        let server = OrchestrationServer::new(config());
        let pool = server.pool().clone();
        let mut events = pool.subscribe();

        let first = pool.add_connection().unwrap();
        pool.register_logical_id(&first.connection_id, "agent-1", EndpointRole::Agent, vec![])
            .unwrap();
        pool.remove_connection(&first.connection_id, DisconnectReason::Closed);

        // Agent is back before the core loop sees the old disconnect
        let second = pool.add_connection().unwrap();
        pool.register_logical_id(&second.connection_id, "agent-1", EndpointRole::Agent, vec![])
            .unwrap();
        server
            .task_queue()
            .lock()
            .worker_available("agent-1", Vec::<String>::new());
        server
            .submit_task(NewTask::new("job").with_id("job"))
            .await
            .unwrap();

        let stale = loop {
            match events.try_recv().unwrap() {
                event @ PoolEvent::Disconnected { .. } => break event,
                _ => continue,
            }
        };
        server.core.handle_pool_event(stale).await;

        let queue = server.task_queue().lock();
        assert_eq!(queue.assigned_task("agent-1").map(String::as_str), Some("job"));
        let task = queue.get_task("job").unwrap();
        assert_eq!(task.status, crate::state_machine::TaskStatus::InProgress);
        assert_eq!(task.attempts, 1);
        drop(queue);
        assert!(server.pool().is_bound("agent-1"));
    }

    #[tokio::test]
    async fn test_disconnect_of_current_connection_releases_task() {
        let server = OrchestrationServer::new(config());
        let pool = server.pool().clone();
        let mut events = pool.subscribe();

        let only = pool.add_connection().unwrap();
        pool.register_logical_id(&only.connection_id, "agent-1", EndpointRole::Agent, vec![])
            .unwrap();
        server
            .task_queue()
            .lock()
            .worker_available("agent-1", Vec::<String>::new());
        server
            .submit_task(NewTask::new("job").with_id("job"))
            .await
            .unwrap();
        pool.remove_connection(&only.connection_id, DisconnectReason::Closed);

        let gone = loop {
            match events.try_recv().unwrap() {
                event @ PoolEvent::Disconnected { .. } => break event,
                _ => continue,
            }
        };
        server.core.handle_pool_event(gone).await;

        let queue = server.task_queue().lock();
        assert!(queue.assigned_task("agent-1").is_none());
        assert_eq!(
            queue.get_task("job").unwrap().status,
            crate::state_machine::TaskStatus::Ready
        );
    }
}
