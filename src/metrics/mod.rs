//! # Metrics and Notification Sinks
//!
//! Counters (tasks created/completed/failed, messages sent/received) and
//! domain notifications leave the core through [`MetricsSink`]. Sinks are
//! best-effort: [`Metrics`] isolates the core from a sink that panics, so a
//! broken sink can never change scheduling or routing outcomes.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

const MAX_RECORDED_NOTIFICATIONS: usize = 1000;

/// Receiver for counters and domain notifications
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn increment(&self, name: &str, by: u64);

    fn notify(&self, event: &str, payload: &Value);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _by: u64) {}

    fn notify(&self, _event: &str, _payload: &Value) {}
}

/// Counter store backed by a `DashMap`, plus a bounded notification log
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    notifications: Mutex<VecDeque<(String, Value)>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|value| *value).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn notifications(&self) -> Vec<(String, Value)> {
        self.notifications.lock().iter().cloned().collect()
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.notifications.lock().clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += by;
    }

    fn notify(&self, event: &str, payload: &Value) {
        let mut notifications = self.notifications.lock();
        if notifications.len() >= MAX_RECORDED_NOTIFICATIONS {
            notifications.pop_front();
        }
        notifications.push_back((event.to_string(), payload.clone()));
    }
}

/// Shared handle used by the core to reach a sink
#[derive(Debug, Clone)]
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, by: u64) {
        let sink = &self.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.increment(name, by))).is_err() {
            warn!(counter = name, "⚠️ Metrics sink panicked while recording counter");
        }
    }

    pub fn notify(&self, event: &str, payload: &Value) {
        let sink = &self.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.notify(event, payload))).is_err() {
            warn!(event = event, "⚠️ Notification sink panicked");
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::noop()
    }
}
