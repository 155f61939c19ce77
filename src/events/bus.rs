//! # Event Bus
//!
//! Topic-based in-process pub/sub. Subscribers register an [`EventHandler`]
//! and get a [`SubscriptionToken`] back; dropping interest is an explicit
//! [`EventBus::unsubscribe`] with that token.
//!
//! Dispatch isolates handlers from each other: every handler runs under the
//! configured timeout, panics are caught, and each topic has its own circuit
//! breaker (`event:<topic>`) so a persistently failing handler set stops
//! being invoked for a while. Handler failures are logged and never reach
//! the publisher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::EventsConfig;
use crate::error::{ConductorError, Result};
use crate::resilience::CircuitBreakerManager;

const OBSERVER_CHANNEL_CAPACITY: usize = 1000;

tokio::task_local! {
    /// Nested publications per topic on the current call chain
    static PUBLISH_DEPTHS: HashMap<String, usize>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventBusError {
    #[error("Event channel limit of {max} reached, cannot add topic {topic}")]
    ChannelLimit { topic: String, max: usize },

    #[error("Topic {topic} already has the maximum of {max} subscribers")]
    SubscriberLimit { topic: String, max: usize },

    #[error("Recursive publication of {topic} exceeded depth {max_depth}")]
    RecursionLimit { topic: String, max_depth: usize },

    #[error("Event bus has been disposed")]
    Disposed,
}

impl From<EventBusError> for ConductorError {
    fn from(error: EventBusError) -> Self {
        match error {
            EventBusError::ChannelLimit { .. }
            | EventBusError::SubscriberLimit { .. }
            | EventBusError::RecursionLimit { .. } => {
                ConductorError::CapacityExceeded(error.to_string())
            }
            EventBusError::Disposed => ConductorError::Internal(error.to_string()),
        }
    }
}

pub type EventBusResult<T> = std::result::Result<T, EventBusError>;

/// A published event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Adapts an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    id: u64,
    topic: String,
}

impl SubscriptionToken {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

pub struct EventBus {
    config: EventsConfig,
    channels: RwLock<HashMap<String, Vec<Subscriber>>>,
    breakers: Arc<CircuitBreakerManager>,
    observers: broadcast::Sender<Event>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.channels.read().len())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventsConfig, breakers: Arc<CircuitBreakerManager>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CHANNEL_CAPACITY);
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            breakers,
            observers,
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> EventBusResult<SubscriptionToken> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(EventBusError::Disposed);
        }
        let topic = topic.into();
        let mut channels = self.channels.write();

        if !channels.contains_key(&topic) && channels.len() >= self.config.max_channels {
            warn!(topic = %topic, max = self.config.max_channels, "🚫 Event channel limit reached");
            return Err(EventBusError::ChannelLimit {
                topic,
                max: self.config.max_channels,
            });
        }

        let subscribers = channels.entry(topic.clone()).or_default();
        if subscribers.len() >= self.config.max_subscribers_per_channel {
            warn!(topic = %topic, "🚫 Subscriber limit reached");
            return Err(EventBusError::SubscriberLimit {
                topic,
                max: self.config.max_subscribers_per_channel,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber { id, handler });
        debug!(topic = %topic, subscription_id = id, "Subscribed");
        Ok(SubscriptionToken { id, topic })
    }

    /// Returns whether the token was still subscribed
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(&token.topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != token.id);
        let removed = subscribers.len() < before;
        if subscribers.is_empty() {
            channels.remove(&token.topic);
        }
        removed
    }

    /// Receive a copy of every published event, regardless of topic
    pub fn observe(&self) -> broadcast::Receiver<Event> {
        self.observers.subscribe()
    }

    /// Deliver `payload` to every handler of `topic`
    ///
    /// Returns how many handlers completed successfully. Only the recursion
    /// limit and disposal are reported as errors. Depth counts publications
    /// of `topic` nested inside handlers of the same call chain; unrelated
    /// concurrent publishers never count toward each other.
    pub async fn publish(&self, topic: &str, payload: Value) -> EventBusResult<usize> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(EventBusError::Disposed);
        }

        let mut chain = PUBLISH_DEPTHS
            .try_with(|depths| depths.clone())
            .unwrap_or_default();
        let depth = chain.entry(topic.to_string()).or_insert(0);
        if *depth >= self.config.max_recursion_depth {
            warn!(topic = topic, depth = *depth, "🔁 Event recursion limit hit");
            return Err(EventBusError::RecursionLimit {
                topic: topic.to_string(),
                max_depth: self.config.max_recursion_depth,
            });
        }
        *depth += 1;

        PUBLISH_DEPTHS.scope(chain, self.dispatch(topic, payload)).await
    }

    async fn dispatch(&self, topic: &str, payload: Value) -> EventBusResult<usize> {
        let event = Event {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        };
        let _ = self.observers.send(event.clone());

        let subscribers = self
            .channels
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        if subscribers.is_empty() {
            return Ok(0);
        }

        let breaker = self
            .breakers
            .get_circuit_breaker(&format!("event:{topic}"))
            .await;
        let timeout = self.config.handler_timeout();

        let mut delivered = 0;
        for subscriber in subscribers {
            let outcome = breaker
                .call(|| run_handler(subscriber.handler.as_ref(), &event, timeout))
                .await
                .map_err(ConductorError::from);
            match outcome {
                Ok(()) => delivered += 1,
                Err(error) => error!(
                    topic = topic,
                    subscription_id = subscriber.id,
                    error = %error,
                    "❌ Event handler failed"
                ),
            }
        }
        Ok(delivered)
    }

    pub fn topics(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels.read().get(topic).map_or(0, Vec::len)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Drop every subscription; safe to call repeatedly
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.channels.write().clear();
    }
}

async fn run_handler(
    handler: &dyn EventHandler,
    event: &Event,
    timeout: Duration,
) -> Result<()> {
    let guarded = AssertUnwindSafe(handler.handle(event)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ConductorError::Internal(format!(
            "Handler for {} panicked",
            event.topic
        ))),
        Err(_) => Err(ConductorError::Timeout(format!(
            "Handler for {} exceeded {}ms",
            event.topic,
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    fn bus(config: EventsConfig) -> EventBus {
        EventBus::new(
            config,
            Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default())),
        )
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            panic!("handler panic");
        }
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        handler_fn(move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = bus(EventsConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("task.completed", counting(counter.clone())).unwrap();
        bus.subscribe("task.completed", counting(counter.clone())).unwrap();

        let delivered = bus.publish("task.completed", json!({"taskId": "t1"})).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(bus.publish("task.failed", json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = bus(EventsConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "task.failed",
            handler_fn(|_event| async { Err(ConductorError::Internal("boom".into())) }),
        )
        .unwrap();
        bus.subscribe("task.failed", Arc::new(PanickingHandler)).unwrap();
        bus.subscribe("task.failed", counting(counter.clone())).unwrap();

        let delivered = bus.publish("task.failed", json!({})).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let bus = bus(EventsConfig {
            handler_timeout_ms: 50,
            ..EventsConfig::default()
        });
        bus.subscribe(
            "agent.status",
            handler_fn(|_event| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(bus.publish("agent.status", json!({})).await.unwrap(), 0);
    }

    #[test]
    fn test_capacity_limits() {
        let bus = bus(EventsConfig {
            max_channels: 1,
            max_subscribers_per_channel: 1,
            ..EventsConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("a", counting(counter.clone())).unwrap();
        assert!(matches!(
            bus.subscribe("a", counting(counter.clone())),
            Err(EventBusError::SubscriberLimit { .. })
        ));
        assert!(matches!(
            bus.subscribe("b", counting(counter)),
            Err(EventBusError::ChannelLimit { .. })
        ));
    }

    #[tokio::test]
    async fn test_recursive_publication_is_bounded() {
        static BUS: OnceLock<Arc<EventBus>> = OnceLock::new();
        let bus = BUS.get_or_init(|| {
            Arc::new(bus(EventsConfig {
                max_recursion_depth: 3,
                ..EventsConfig::default()
            }))
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bus.subscribe(
            "loop",
            handler_fn(move |_event| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if let Some(bus) = BUS.get() {
                        bus.publish("loop", json!({})).boxed().await?;
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

        bus.publish("loop", json!({})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Counter unwinds fully once publication returns
        bus.publish("loop", json!({})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_publishers_do_not_share_depth() {
        let bus = bus(EventsConfig {
            max_recursion_depth: 1,
            ..EventsConfig::default()
        });
        bus.subscribe(
            "task.submitted",
            handler_fn(|_event| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }),
        )
        .unwrap();

        let (first, second) = tokio::join!(
            bus.publish("task.submitted", json!({"taskId": "a"})),
            bus.publish("task.submitted", json!({"taskId": "b"})),
        );
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_dispose_twice() {
        let bus = bus(EventsConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let token = bus.subscribe("x", counting(counter)).unwrap();
        assert!(bus.unsubscribe(&token));
        assert!(!bus.unsubscribe(&token));
        assert!(bus.topics().is_empty());

        bus.dispose();
        bus.dispose();
        assert!(bus.is_disposed());
        assert_eq!(bus.publish("x", json!({})).await, Err(EventBusError::Disposed));
    }
}
