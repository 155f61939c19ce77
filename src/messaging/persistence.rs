//! # Message Persistence
//!
//! The router persists every routed message through [`MessageStore`] so that
//! endpoints reconnecting under a known logical id can be replayed what they
//! missed. [`InMemoryMessageStore`] is a bounded ring buffer: a global cap,
//! a per-type secondary index and a per-recipient cap, each evicting the
//! oldest entries first.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

use super::message::{Message, MessageType};
use crate::config::HistoryConfig;
use crate::error::ConductorError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    #[error("Message store rejected write: {0}")]
    WriteRejected(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

impl From<PersistenceError> for ConductorError {
    fn from(error: PersistenceError) -> Self {
        ConductorError::Persistence(error.to_string())
    }
}

/// Query over persisted messages; results are always oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    /// Matches messages sent from or addressed to this id
    pub logical_id: Option<String>,
    /// Matches messages addressed to this id
    pub recipient: Option<String>,
    pub message_type: Option<MessageType>,
    /// Inclusive `(start, end)` in epoch milliseconds
    pub time_range: Option<(i64, i64)>,
    /// Exclusive lower bound in epoch milliseconds
    pub after: Option<i64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_logical_id(mut self, logical_id: impl Into<String>) -> Self {
        self.logical_id = Some(logical_id.into());
        self
    }

    pub fn addressed_to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn between(mut self, start: i64, end: i64) -> Self {
        self.time_range = Some((start, end));
        self
    }

    pub fn after(mut self, timestamp: i64) -> Self {
        self.after = Some(timestamp);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(id) = &self.logical_id {
            if &message.from != id && &message.to != id {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if &message.to != recipient {
                return false;
            }
        }
        if let Some(kind) = self.message_type {
            if message.message_type != kind {
                return false;
            }
        }
        if let Some((start, end)) = self.time_range {
            if message.timestamp < start || message.timestamp > end {
                return false;
            }
        }
        if let Some(after) = self.after {
            if message.timestamp <= after {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
    pub by_type: HashMap<MessageType, usize>,
}

/// Persistence collaborator consumed by the router
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Called once at server start; failure aborts the start
    async fn initialize(&self) -> PersistenceResult<()> {
        Ok(())
    }

    async fn save(&self, message: &Message) -> PersistenceResult<()>;

    async fn get(&self, message_id: &str) -> PersistenceResult<Option<Message>>;

    /// Insertion-ordered page of all messages
    async fn load(&self, offset: usize, limit: usize) -> PersistenceResult<Vec<Message>>;

    async fn get_history(&self, filter: &HistoryFilter) -> PersistenceResult<Vec<Message>>;

    async fn clear(&self) -> PersistenceResult<()>;

    async fn get_stats(&self) -> PersistenceResult<StoreStats>;
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Insertion sequence -> message
    entries: BTreeMap<u64, Message>,
    ids: HashMap<String, u64>,
    by_type: HashMap<MessageType, VecDeque<u64>>,
    by_recipient: HashMap<String, VecDeque<u64>>,
    next_seq: u64,
}

impl StoreInner {
    fn insert(&mut self, message: Message, max_messages: usize, max_per_recipient: usize) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(previous) = self.ids.insert(message.id.clone(), seq) {
            // Same id saved again: keep only the newest copy
            self.evict(previous);
        }
        self.by_type
            .entry(message.message_type)
            .or_default()
            .push_back(seq);
        self.by_recipient
            .entry(message.to.clone())
            .or_default()
            .push_back(seq);
        let recipient = message.to.clone();
        self.entries.insert(seq, message);

        let mut evicted = 0;
        while self
            .by_recipient
            .get(&recipient)
            .is_some_and(|queue| queue.len() > max_per_recipient)
        {
            let Some(oldest) = self.by_recipient.get(&recipient).and_then(|q| q.front().copied())
            else {
                break;
            };
            self.evict(oldest);
            evicted += 1;
        }
        while self.entries.len() > max_messages {
            let Some((&oldest, _)) = self.entries.first_key_value() else {
                break;
            };
            self.evict(oldest);
            evicted += 1;
        }
        evicted
    }

    fn evict(&mut self, seq: u64) {
        let Some(message) = self.entries.remove(&seq) else {
            return;
        };
        if self.ids.get(&message.id) == Some(&seq) {
            self.ids.remove(&message.id);
        }
        remove_from_index(&mut self.by_type, &message.message_type, seq);
        remove_from_index(&mut self.by_recipient, &message.to, seq);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
        self.by_type.clear();
        self.by_recipient.clear();
    }
}

/// Remove `seq` from an index queue, O(1) when it is the oldest entry
fn remove_from_index<K, Q>(index: &mut HashMap<K, VecDeque<u64>>, key: &Q, seq: u64)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    let Some(queue) = index.get_mut(key) else {
        return;
    };
    if queue.front() == Some(&seq) {
        queue.pop_front();
    } else if let Some(position) = queue.iter().position(|&s| s == seq) {
        queue.remove(position);
    }
    if queue.is_empty() {
        index.remove(key);
    }
}

#[derive(Debug)]
pub struct InMemoryMessageStore {
    max_messages: usize,
    max_per_recipient: usize,
    inner: RwLock<StoreInner>,
}

impl InMemoryMessageStore {
    pub fn new(max_messages: usize, max_per_recipient: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            max_per_recipient: max_per_recipient.max(1),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(config.max_messages, config.max_messages_per_logical_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn initialize(&self) -> PersistenceResult<()> {
        info!(
            max_messages = self.max_messages,
            max_per_recipient = self.max_per_recipient,
            "💾 In-memory message store ready"
        );
        Ok(())
    }

    async fn save(&self, message: &Message) -> PersistenceResult<()> {
        let evicted = self.inner.write().insert(
            message.clone(),
            self.max_messages,
            self.max_per_recipient,
        );
        if evicted > 0 {
            debug!(evicted, "♻️ Evicted oldest persisted messages");
        }
        Ok(())
    }

    async fn get(&self, message_id: &str) -> PersistenceResult<Option<Message>> {
        let inner = self.inner.read();
        Ok(inner
            .ids
            .get(message_id)
            .and_then(|seq| inner.entries.get(seq))
            .cloned())
    }

    async fn load(&self, offset: usize, limit: usize) -> PersistenceResult<Vec<Message>> {
        let inner = self.inner.read();
        Ok(inner
            .entries
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_history(&self, filter: &HistoryFilter) -> PersistenceResult<Vec<Message>> {
        let inner = self.inner.read();
        let limit = filter.limit.unwrap_or(usize::MAX);

        // Narrow through a secondary index when the filter allows it
        let candidates: Box<dyn Iterator<Item = &Message>> =
            if let Some(kind) = filter.message_type {
                Box::new(
                    inner
                        .by_type
                        .get(&kind)
                        .into_iter()
                        .flatten()
                        .filter_map(|seq| inner.entries.get(seq)),
                )
            } else if let Some(recipient) = &filter.recipient {
                Box::new(
                    inner
                        .by_recipient
                        .get(recipient)
                        .into_iter()
                        .flatten()
                        .filter_map(|seq| inner.entries.get(seq)),
                )
            } else {
                Box::new(inner.entries.values())
            };

        Ok(candidates
            .filter(|message| filter.matches(message))
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn clear(&self) -> PersistenceResult<()> {
        self.inner.write().clear();
        Ok(())
    }

    async fn get_stats(&self) -> PersistenceResult<StoreStats> {
        let inner = self.inner.read();
        Ok(StoreStats {
            count: inner.entries.len(),
            oldest_timestamp: inner.entries.values().map(|m| m.timestamp).min(),
            newest_timestamp: inner.entries.values().map(|m| m.timestamp).max(),
            by_type: inner
                .by_type
                .iter()
                .map(|(kind, seqs)| (*kind, seqs.len()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::{HeartbeatPayload, MessagePayload, TaskRefPayload};

    fn message(id: usize, to: &str, timestamp: i64) -> Message {
        let mut message = Message::new(
            "conductor",
            to,
            MessagePayload::TaskAccepted(TaskRefPayload {
                task_id: format!("t{id}"),
            }),
        );
        message.id = format!("m{id}");
        message.timestamp = timestamp;
        message
    }

    #[tokio::test]
    async fn test_ring_buffer_keeps_newest() {
        let store = InMemoryMessageStore::new(1000, 2000);
        for i in 0..1100 {
            store.save(&message(i, "agent-1", i as i64)).await.unwrap();
        }

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.count, 1000);
        assert_eq!(stats.oldest_timestamp, Some(100));
        assert_eq!(stats.by_type.get(&MessageType::TaskAccepted), Some(&1000));

        let all = store.load(0, 2000).await.unwrap();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.first().unwrap().id, "m100");
        assert_eq!(all.last().unwrap().id, "m1099");
        assert!(store.get("m99").await.unwrap().is_none());
        assert!(store.get("m100").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_per_recipient_cap() {
        let store = InMemoryMessageStore::new(100, 3);
        for i in 0..5 {
            store.save(&message(i, "agent-1", i as i64)).await.unwrap();
        }
        store.save(&message(10, "agent-2", 10)).await.unwrap();

        let agent_one = store
            .get_history(&HistoryFilter::new().addressed_to("agent-1"))
            .await
            .unwrap();
        let ids: Vec<_> = agent_one.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_history_filters() {
        let store = InMemoryMessageStore::new(100, 100);
        for i in 0..6 {
            store.save(&message(i, "agent-1", i as i64 * 10)).await.unwrap();
        }
        let mut heartbeat = Message::new(
            "agent-1",
            "conductor",
            MessagePayload::Heartbeat(HeartbeatPayload::default()),
        );
        heartbeat.timestamp = 25;
        store.save(&heartbeat).await.unwrap();

        let by_type = store
            .get_history(&HistoryFilter::new().of_type(MessageType::Heartbeat))
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);

        let involving = store
            .get_history(&HistoryFilter::new().for_logical_id("agent-1"))
            .await
            .unwrap();
        assert_eq!(involving.len(), 7);

        let window = store
            .get_history(&HistoryFilter::new().addressed_to("agent-1").between(10, 30))
            .await
            .unwrap();
        assert_eq!(window.len(), 3);

        let after = store
            .get_history(&HistoryFilter::new().addressed_to("agent-1").after(30).page(1, 1))
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "m5");
    }

    #[tokio::test]
    async fn test_clear_twice() {
        let store = InMemoryMessageStore::new(10, 10);
        store.save(&message(1, "agent-1", 1)).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();

        assert!(store.is_empty());
        assert_eq!(store.get_stats().await.unwrap(), StoreStats::default());
    }
}
