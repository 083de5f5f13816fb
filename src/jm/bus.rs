//! Event bus: single-producer fan-out of phase-change records.
//!
//! The bus is owned by the dispatcher, which is the only publisher, so
//! records reach every subscriber in publication order. Each subscriber has
//! its own bounded queue; a subscriber whose queue overflows is disconnected
//! rather than silently skipping records.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::jm::rpc::{EventRecord, PhaseName};

/// Buffered records per subscriber before it is declared too slow.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// One phase transition as published on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub job: String,
    pub status: PhaseName,
    pub at: Instant,
}

impl Event {
    pub fn now(job: &str, status: PhaseName) -> Self {
        Self {
            job: job.to_string(),
            status,
            at: Instant::now(),
        }
    }

    pub fn record(&self) -> EventRecord {
        EventRecord {
            job: self.job.clone(),
            status: self.status,
        }
    }
}

/// Opaque handle identifying a streaming subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    filter: Option<String>,
    tx: mpsc::Sender<Event>,
}

struct Waiter {
    job: String,
    tx: oneshot::Sender<Event>,
}

pub struct EventBus {
    next_id: u64,
    buffer: usize,
    subscribers: Vec<Subscriber>,
    waiters: Vec<Waiter>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            next_id: 0,
            buffer: buffer.max(1),
            subscribers: Vec::new(),
            waiters: Vec::new(),
        }
    }

    /// Registers a streaming subscriber. With a filter, only records for
    /// that job are delivered. Records published before registration are
    /// never seen.
    pub fn subscribe(&mut self, filter: Option<String>) -> (SubscriberId, mpsc::Receiver<Event>) {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.push(Subscriber { id, filter, tx });
        (id, rx)
    }

    /// Removes a subscriber. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.retain(|s| s.id != id);
    }

    /// Registers a single-shot waiter resolved by the next record for `job`.
    pub fn wait_for(&mut self, job: &str) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter {
            job: job.to_string(),
            tx,
        });
        rx
    }

    pub fn publish(&mut self, event: Event) {
        self.subscribers.retain(|s| {
            if let Some(f) = &s.filter {
                if f != &event.job {
                    return true;
                }
            }
            match s.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = s.id.0, job = %event.job, "disconnecting slow event subscriber");
                    false
                }
                // Receiver side is gone; prune quietly.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        let mut kept = Vec::with_capacity(self.waiters.len());
        for w in self.waiters.drain(..) {
            if w.job == event.job {
                // Single-shot: a dropped receiver just means the client left.
                let _ = w.tx.send(event.clone());
            } else {
                kept.push(w);
            }
        }
        self.waiters = kept;
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
