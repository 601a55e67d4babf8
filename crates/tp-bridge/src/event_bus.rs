use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::protocol::{EngineEvent, EventEnvelope};

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a receiver that gets
/// every event published afterwards. Clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EventEnvelope>>>>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<EventEnvelope> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish to all current subscribers and return how many received it.
    ///
    /// Subscribers whose receivers were dropped are pruned.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let envelope = EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            event,
        };
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(envelope.clone()).is_ok());
        debug!(
            event = envelope.event.name(),
            seq = envelope.seq,
            subscribers = senders.len(),
            "event published"
        );
        senders.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
