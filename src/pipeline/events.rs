//! Bounded FIFO of state-change events

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::records::ServerEvent;

/// Result of waiting on the bus
#[derive(Debug)]
pub enum Consumed {
    Event(ServerEvent),
    /// Nothing arrived within the poll interval; check your peer and retry
    Idle,
}

#[derive(Default)]
struct Stats {
    published: AtomicUsize,
    consumed: AtomicUsize,
    dropped: AtomicUsize,
}

/// Single shared queue of [`ServerEvent`]s.
///
/// Publishing never blocks: when the queue is full the oldest event is
/// discarded to make room. Every event goes to exactly one reader; there is
/// no fan-out.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<ServerEvent>,
    rx: Receiver<ServerEvent>,
    stats: Arc<Stats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            stats: Arc::default(),
        }
    }

    pub fn publish(&self, event: ServerEvent) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("events_published").increment(1);
                    return;
                }
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("events_dropped").increment(1);
                        warn!(id = %oldest.id, "Event queue full, dropped oldest event");
                    }
                    event = rejected;
                }
                // unreachable while we hold a receiver
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Wait up to `poll` for the next event.
    pub async fn consume(&self, poll: Duration) -> Consumed {
        match tokio::time::timeout(poll, self.rx.recv_async()).await {
            Ok(Ok(event)) => {
                self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                debug!(id = %event.id, kind = event.event_type(), "Event consumed");
                Consumed::Event(event)
            }
            Ok(Err(_)) | Err(_) => Consumed::Idle,
        }
    }

    pub fn try_consume(&self) -> Option<ServerEvent> {
        let event = self.rx.try_recv().ok()?;
        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// (published, consumed, dropped)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.published.load(Ordering::Relaxed),
            self.stats.consumed.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }
}
