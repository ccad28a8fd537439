//! Bounded work queue between the poller and the stream processors.
//!
//! Three priority lanes with at-least-once delivery: consumers that fail
//! before persisting an event requeue it, and the idempotent record store
//! absorbs the duplicate. Backpressure policy: low-priority events are
//! dropped as soon as their lane is full, medium-priority events wait up
//! to the configured bound and are then dropped, high-priority events wait
//! as long as it takes and are never dropped.

use crate::error::{Error, Result};
use crate::event::{Event, Priority};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Cumulative drop counts, surfaced through the processing-stats stream.
#[derive(Debug, Default)]
pub struct DropCounters {
    pub low: AtomicU64,
    pub medium: AtomicU64,
}

impl DropCounters {
    pub fn snapshot(&self) -> HashMap<String, u64> {
        HashMap::from([
            ("low".to_string(), self.low.load(Ordering::Relaxed)),
            ("medium".to_string(), self.medium.load(Ordering::Relaxed)),
            ("high".to_string(), 0),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Dropped,
}

#[derive(Clone)]
pub struct QueueHandle {
    high: mpsc::Sender<Event>,
    medium: mpsc::Sender<Event>,
    low: mpsc::Sender<Event>,
    drops: Arc<DropCounters>,
}

pub struct QueueConsumer {
    high: mpsc::Receiver<Event>,
    medium: mpsc::Receiver<Event>,
    low: mpsc::Receiver<Event>,
    high_open: bool,
    medium_open: bool,
    low_open: bool,
}

/// Build a queue with the given per-lane capacity.
pub fn event_queue(capacity: usize) -> (QueueHandle, QueueConsumer, Arc<DropCounters>) {
    let capacity = capacity.max(1);
    let (high_tx, high_rx) = mpsc::channel(capacity);
    let (medium_tx, medium_rx) = mpsc::channel(capacity);
    let (low_tx, low_rx) = mpsc::channel(capacity);
    let drops = Arc::new(DropCounters::default());

    (
        QueueHandle {
            high: high_tx,
            medium: medium_tx,
            low: low_tx,
            drops: drops.clone(),
        },
        QueueConsumer {
            high: high_rx,
            medium: medium_rx,
            low: low_rx,
            high_open: true,
            medium_open: true,
            low_open: true,
        },
        drops,
    )
}

impl QueueHandle {
    /// Enqueue under the backpressure policy. `wait` bounds how long a
    /// medium-priority enqueue may block.
    pub async fn enqueue(
        &self,
        event: Event,
        priority: Priority,
        wait: Duration,
    ) -> Result<EnqueueOutcome> {
        match priority {
            Priority::High => {
                self.high.send(event).await.map_err(|_| Error::QueueClosed)?;
                Ok(EnqueueOutcome::Enqueued)
            }
            Priority::Medium => {
                match tokio::time::timeout(wait, self.medium.send(event)).await {
                    Ok(Ok(())) => Ok(EnqueueOutcome::Enqueued),
                    Ok(Err(_)) => Err(Error::QueueClosed),
                    Err(_) => {
                        self.drops.medium.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::EVENTS_DROPPED.with_label_values(&["medium"]).inc();
                        Ok(EnqueueOutcome::Dropped)
                    }
                }
            }
            Priority::Low => match self.low.try_send(event) {
                Ok(()) => Ok(EnqueueOutcome::Enqueued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.drops.low.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::EVENTS_DROPPED.with_label_values(&["low"]).inc();
                    Ok(EnqueueOutcome::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::QueueClosed),
            },
        }
    }

    /// Put an event back for redelivery after a transient failure.
    pub async fn requeue(&self, event: Event, priority: Priority) -> Result<()> {
        match self.enqueue(event, priority, Duration::from_millis(100)).await? {
            EnqueueOutcome::Enqueued => Ok(()),
            EnqueueOutcome::Dropped => Ok(()),
        }
    }

    pub fn drop_counters(&self) -> Arc<DropCounters> {
        self.drops.clone()
    }
}

async fn recv_or_park(rx: &mut mpsc::Receiver<Event>, open: &mut bool) -> Option<Event> {
    if !*open {
        // Lane is finished; never resolve so the other arms win.
        std::future::pending::<()>().await;
        unreachable!()
    }
    let value = rx.recv().await;
    if value.is_none() {
        *open = false;
    }
    value
}

impl QueueConsumer {
    /// Next event, preferring high over medium over low whenever more than
    /// one lane has backlog. Returns `None` once every lane is closed and
    /// drained.
    pub async fn pop(&mut self) -> Option<(Event, Priority)> {
        loop {
            match self.high.try_recv() {
                Ok(event) => return Some((event, Priority::High)),
                Err(TryRecvError::Disconnected) => self.high_open = false,
                Err(TryRecvError::Empty) => {}
            }
            match self.medium.try_recv() {
                Ok(event) => return Some((event, Priority::Medium)),
                Err(TryRecvError::Disconnected) => self.medium_open = false,
                Err(TryRecvError::Empty) => {}
            }
            match self.low.try_recv() {
                Ok(event) => return Some((event, Priority::Low)),
                Err(TryRecvError::Disconnected) => self.low_open = false,
                Err(TryRecvError::Empty) => {}
            }

            if !self.high_open && !self.medium_open && !self.low_open {
                return None;
            }

            tokio::select! {
                event = recv_or_park(&mut self.high, &mut self.high_open) => {
                    if let Some(event) = event {
                        return Some((event, Priority::High));
                    }
                }
                event = recv_or_park(&mut self.medium, &mut self.medium_open) => {
                    if let Some(event) = event {
                        return Some((event, Priority::Medium));
                    }
                }
                event = recv_or_park(&mut self.low, &mut self.low_open) => {
                    if let Some(event) = event {
                        return Some((event, Priority::Low));
                    }
                }
            }
        }
    }

    /// `pop` bounded by a deadline; `Ok(None)` means the queue is closed,
    /// `Err(())` means the deadline passed with no event.
    pub async fn pop_timeout(
        &mut self,
        wait: Duration,
    ) -> std::result::Result<Option<(Event, Priority)>, ()> {
        match tokio::time::timeout(wait, self.pop()).await {
            Ok(item) => Ok(item),
            Err(_) => Err(()),
        }
    }
}
