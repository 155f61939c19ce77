//! Per-key coalescing of high-frequency status updates.
//!
//! The first push for a key arms a timer; pushes arriving before it fires
//! only replace the pending value. When the timer fires the latest value is
//! emitted on the output channel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Arc<Mutex<HashMap<String, T>>>,
    output: mpsc::UnboundedSender<(String, T)>,
}

impl<T> Debouncer<T>
where
    T: Send + 'static,
{
    /// Returns the debouncer and the receiver of coalesced values
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<(String, T)>) {
        let (output, receiver) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                pending: Arc::new(Mutex::new(HashMap::new())),
                output,
            },
            receiver,
        )
    }

    pub fn push(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let armed = self.pending.lock().insert(key.clone(), value).is_some();
        if armed {
            trace!(key = %key, "Coalesced update");
            return;
        }

        let pending = Arc::clone(&self.pending);
        let output = self.output.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let latest = pending.lock().remove(&key);
            if let Some(value) = latest {
                // Receiver gone means the owner shut down
                let _ = output.send((key, value));
            }
        });
    }

    /// Emit every pending value immediately
    pub fn flush(&self) -> usize {
        let drained: Vec<(String, T)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for entry in drained {
            let _ = self.output.send(entry);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Discard pending values without emitting them
    pub fn dispose(&self) {
        self.pending.lock().clear();
    }
}
