//! In-process fan-out bus for observer streams.
//!
//! [`LiveBus`] keeps one bounded `mpsc` sender per subscriber and
//! publishes with `try_send`. A subscriber that stops draining its
//! channel gets dropped at the next publish instead of exerting
//! backpressure on the orchestrator; the event stream is lossy by
//! contract and observers resynchronize from the job list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use elara_core::types::{DbId, FrameNumber};
use elara_db::models::job::Job;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

/// Per-subscriber channel depth. A UI that falls this many events
/// behind is disconnected.
const SUBSCRIBER_BUFFER: usize = 256;

/// One observer-visible occurrence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Job snapshot after a lifecycle change or progress report.
    Job { job: Job },
    /// Frame outcomes from a worker rescan.
    Frames {
        job_id: DbId,
        done: Vec<FrameNumber>,
        failed: Vec<FrameNumber>,
        current_frame: Option<FrameNumber>,
    },
    /// The job is gone (tombstoned or hard-deleted).
    Deleted { job_id: DbId },
}

/// Fan-out hub; share via `Arc` and publish from anywhere.
pub struct LiveBus {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<LiveEvent>>>,
    next_id: AtomicU64,
}

impl LiveBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. Returns its id (for [`unsubscribe`]) and
    /// the receiving half of its channel.
    ///
    /// [`unsubscribe`]: LiveBus::unsubscribe
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<LiveEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.write().await.insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber; harmless if it was already dropped.
    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    /// Deliver an event to every live subscriber. Subscribers whose
    /// channel is full or closed are removed.
    pub async fn publish(&self, event: LiveEvent) {
        let mut subs = self.subscribers.write().await;
        let before = subs.len();
        subs.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(subscriber = id, "dropping lagging event subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let dropped = before - subs.len();
        if dropped > 0 {
            tracing::debug!(dropped, "pruned event subscribers");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for LiveBus {
    fn default() -> Self {
        Self::new()
    }
}
