//! # Message Router
//!
//! Every inbound frame passes through [`MessageRouter::route_raw`]: it is
//! validated, persisted, and then either handed back for conductor-local
//! handling, delivered to the connection bound to its `to`, or kept in the
//! store for replay when the recipient is offline.
//!
//! Delivery runs through the `message_delivery` circuit breaker wrapped
//! around the retry manager, so a flapping peer fails fast instead of
//! stalling the conductor.

use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::message::{Message, MessageType};
use super::persistence::{HistoryFilter, MessageStore};
use super::validation::parse_message;
use crate::constants::{events, metrics};
use crate::error::{ConductorError, Result};
use crate::execution::connection_pool::ConnectionPool;
use crate::logging::{log_error, log_message_operation};
use crate::metrics::Metrics;
use crate::resilience::{CircuitBreaker, RetryManager};

/// Name of the breaker guarding socket delivery
pub const DELIVERY_BREAKER: &str = "message_delivery";

/// What happened to a routed message
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Written to the recipient's outbound queue
    Delivered { message_id: String, recipient: String },
    /// Addressed to the conductor itself
    Local(Message),
    /// Recipient offline; persisted for replay on reconnect
    Queued { message_id: String, recipient: String },
    /// Not deliverable; the `SYSTEM_ERROR` to send back to the sender
    Rejected(Message),
}

/// Newest acknowledged timestamp plus the ids acked at exactly that instant
///
/// Timestamps have millisecond resolution, so several messages can share
/// the watermark; only the ones actually acked are skipped on replay.
#[derive(Debug, Clone)]
struct AckWatermark {
    timestamp: i64,
    acked_ids: HashSet<String>,
}

impl AckWatermark {
    fn covers(&self, message: &Message) -> bool {
        message.timestamp < self.timestamp
            || (message.timestamp == self.timestamp && self.acked_ids.contains(&message.id))
    }
}

#[derive(Debug)]
pub struct MessageRouter {
    conductor_id: String,
    retention_limit: usize,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn MessageStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryManager,
    watermarks: DashMap<String, AckWatermark>,
    metrics: Metrics,
}

impl MessageRouter {
    pub fn new(
        conductor_id: impl Into<String>,
        retention_limit: usize,
        pool: Arc<ConnectionPool>,
        store: Arc<dyn MessageStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryManager,
        metrics: Metrics,
    ) -> Self {
        Self {
            conductor_id: conductor_id.into(),
            retention_limit,
            pool,
            store,
            breaker,
            retry,
            watermarks: DashMap::new(),
            metrics,
        }
    }

    pub fn conductor_id(&self) -> &str {
        &self.conductor_id
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Parse a raw frame, or build the `SYSTEM_ERROR` answering it
    pub fn validate(&self, raw: &str) -> std::result::Result<Message, Message> {
        parse_message(raw).map_err(|failure| {
            warn!(
                field = failure.field.as_deref().unwrap_or("-"),
                sender = failure.sender.as_deref().unwrap_or("unknown"),
                error = %failure,
                "🚫 Rejected malformed message"
            );
            self.metrics.increment(metrics::MESSAGES_REJECTED);
            self.metrics.notify(
                events::MESSAGE_REJECTED,
                &json!({
                    "field": failure.field,
                    "originalId": failure.original_id,
                    "error": failure.message,
                }),
            );
            failure.to_error_response(&self.conductor_id)
        })
    }

    /// Validate and route one raw frame
    pub async fn route_raw(&self, raw: &str) -> RouteOutcome {
        match self.validate(raw) {
            Ok(message) => self.route(message).await,
            Err(error_response) => RouteOutcome::Rejected(error_response),
        }
    }

    /// Route a validated message
    pub async fn route(&self, message: Message) -> RouteOutcome {
        self.metrics.increment(metrics::MESSAGES_RECEIVED);
        log_message_operation(
            "route",
            &message.id,
            message.message_type.as_str(),
            &message.from,
            &message.to,
        );

        if let Err(error) = self.persist(&message).await {
            return RouteOutcome::Rejected(self.error_response(&message, &error));
        }

        if message.to == self.conductor_id {
            return RouteOutcome::Local(message);
        }

        if !self.pool.is_bound(&message.to) {
            debug!(
                message_id = %message.id,
                recipient = %message.to,
                "📥 Recipient offline, message held for replay"
            );
            return RouteOutcome::Queued {
                message_id: message.id,
                recipient: message.to,
            };
        }

        match self.deliver(&message).await {
            Ok(()) => {
                self.metrics.notify(
                    events::MESSAGE_ROUTED,
                    &json!({"messageId": message.id, "to": message.to}),
                );
                RouteOutcome::Delivered {
                    message_id: message.id,
                    recipient: message.to,
                }
            }
            // Binding dropped between the check and the send
            Err(ConductorError::ConnectionUnbound(_)) if !self.pool.is_bound(&message.to) => {
                RouteOutcome::Queued {
                    message_id: message.id,
                    recipient: message.to,
                }
            }
            Err(error) => {
                log_error("router", "deliver", &error.to_string(), Some(&message.id));
                self.metrics.increment(metrics::MESSAGES_REJECTED);
                RouteOutcome::Rejected(self.error_response(&message, &error))
            }
        }
    }

    /// Persist and deliver a conductor-originated message
    ///
    /// An offline recipient is not an error: the message waits for replay.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.persist(message).await?;
        if !self.pool.is_bound(&message.to) {
            debug!(
                message_id = %message.id,
                recipient = %message.to,
                "Recipient offline, outbound message held for replay"
            );
            return Ok(());
        }
        self.deliver(message).await
    }

    /// Persist and deliver, failing when the recipient is offline
    pub async fn send_required(&self, message: &Message) -> Result<()> {
        self.persist(message).await?;
        if !self.pool.is_bound(&message.to) {
            return Err(ConductorError::ConnectionUnbound(message.to.clone()));
        }
        self.deliver(message).await
    }

    /// Advance the replay watermark of `logical_id` past `ack_id`
    pub async fn acknowledge(&self, logical_id: &str, ack_id: &str) -> Result<bool> {
        let Some(acked) = self.store.get(ack_id).await? else {
            debug!(ack_id = ack_id, "Ack for unknown or evicted message");
            return Ok(false);
        };
        if acked.to != logical_id {
            return Ok(false);
        }

        let mut watermark = self
            .watermarks
            .entry(logical_id.to_string())
            .or_insert_with(|| AckWatermark {
                timestamp: acked.timestamp,
                acked_ids: HashSet::new(),
            });
        if acked.timestamp > watermark.timestamp {
            watermark.timestamp = acked.timestamp;
            watermark.acked_ids.clear();
        }
        if acked.timestamp == watermark.timestamp {
            watermark.acked_ids.insert(acked.id);
        }
        Ok(true)
    }

    /// Newest acknowledged timestamp for `logical_id`
    pub fn watermark(&self, logical_id: &str) -> Option<i64> {
        self.watermarks.get(logical_id).map(|entry| entry.timestamp)
    }

    /// Re-send persisted messages addressed to `logical_id` that it has not acked
    ///
    /// Everything older than the watermark is skipped, as are acked messages
    /// sharing its timestamp. At most `retention_limit` of the newest eligible
    /// messages are sent, oldest first. Returns how many were delivered.
    pub async fn replay(&self, logical_id: &str) -> Result<usize> {
        let watermark = self
            .watermarks
            .get(logical_id)
            .map(|entry| entry.value().clone());
        let mut filter = HistoryFilter::new().addressed_to(logical_id);
        if let Some(watermark) = &watermark {
            filter = filter.between(watermark.timestamp, i64::MAX);
        }

        let history = self.store.get_history(&filter).await?;
        let eligible: Vec<Message> = history
            .into_iter()
            .filter(|message| message.message_type.is_replayable())
            .filter(|message| !watermark.as_ref().is_some_and(|mark| mark.covers(message)))
            .collect();
        let skip = eligible.len().saturating_sub(self.retention_limit);

        let mut replayed = 0;
        for message in eligible.into_iter().skip(skip) {
            match self.deliver(&message).await {
                Ok(()) => replayed += 1,
                Err(error) => {
                    warn!(
                        logical_id = logical_id,
                        message_id = %message.id,
                        error = %error,
                        "Replay interrupted"
                    );
                    break;
                }
            }
        }

        if replayed > 0 {
            info!(logical_id = logical_id, replayed, "📼 Replayed missed messages");
            self.metrics
                .increment_by(metrics::MESSAGES_REPLAYED, replayed as u64);
        }
        Ok(replayed)
    }

    /// `SYSTEM_ERROR` answering `message`
    pub fn error_response(&self, message: &Message, error: &ConductorError) -> Message {
        Message::system_error(
            &self.conductor_id,
            &message.from,
            error,
            Some(message.id.clone()),
        )
    }

    async fn persist(&self, message: &Message) -> Result<()> {
        // Keepalives would crowd real traffic out of the ring buffer
        if message.message_type == MessageType::Heartbeat {
            return Ok(());
        }
        self.store.save(message).await.map_err(|error| {
            let error = ConductorError::from(error);
            log_error("router", "persist", &error.to_string(), Some(&message.id));
            error
        })
    }

    async fn deliver(&self, message: &Message) -> Result<()> {
        let frame = message.to_json_line()?;
        let pool = &self.pool;
        let recipient = message.to.as_str();

        self.breaker
            .call(|| async {
                self.retry
                    .execute(|| {
                        let frame = frame.clone();
                        async move {
                            pool.send_to_logical(recipient, frame)
                                .await
                                .map_err(ConductorError::from)
                        }
                    })
                    .await
            })
            .await
            .map_err(ConductorError::from)
    }
}
