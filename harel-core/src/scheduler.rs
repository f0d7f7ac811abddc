//! Delayed send scheduler.

use crate::queue::ExternalQueue;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use harel_model::Event;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A pending delayed send, as persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSend {
    pub send_id: String,
    pub event: Event,
    pub due: DateTime<Utc>,
}

struct PendingSend {
    event: Event,
    due: DateTime<Utc>,
    /// Distinguishes this entry from a later one under the same send id.
    generation: u64,
    handle: JoinHandle<()>,
}

type PendingMap = Arc<DashMap<String, PendingSend>>;

/// Enqueues the pending send `id` if it is still the entry armed as
/// `generation`. Returns whether it fired.
async fn fire(pending: &PendingMap, queue: &ExternalQueue, id: &str, generation: u64) -> bool {
    let Some((_, fired)) = pending.remove_if(id, |_, p| p.generation == generation) else {
        return false;
    };
    debug!("Delayed send {} fired: {}", id, fired.event.name);
    if let Err(e) = queue.enqueue(fired.event).await {
        warn!("Dropped delayed event {}: {}", id, e);
    }
    true
}

/// Timers keyed by send id; firing enqueues into the session's external
/// queue.
pub struct DelayedSendScheduler {
    queue: Arc<ExternalQueue>,
    pending: PendingMap,
    generations: AtomicU64,
}

impl DelayedSendScheduler {
    pub fn new(queue: Arc<ExternalQueue>) -> Self {
        Self {
            queue,
            pending: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Arms a timer. A pending send with the same id is replaced.
    pub fn schedule(&self, send_id: String, event: Event, delay: Duration) {
        let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = tokio::time::Instant::now() + delay;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        // The timer must not fire before its entry is registered.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let pending = self.pending.clone();
        let queue = self.queue.clone();
        let id = send_id.clone();
        let handle = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep_until(deadline).await;
            fire(&pending, &queue, &id, generation).await;
        });

        let replaced = self.pending.insert(
            send_id.clone(),
            PendingSend {
                event,
                due,
                generation,
                handle,
            },
        );
        if let Some(old) = replaced {
            old.handle.abort();
        }
        let _ = armed_tx.send(());
        debug!("Scheduled delayed send {} in {}ms", send_id, delay.as_millis());
    }

    /// Cancels a pending send. Unknown or already fired ids are a no-op.
    pub fn cancel(&self, send_id: &str) -> bool {
        match self.pending.remove(send_id) {
            Some((_, pending)) => {
                pending.handle.abort();
                debug!("Cancelled delayed send {}", send_id);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, send_id: &str) -> bool {
        self.pending.contains_key(send_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending sends ordered by due time.
    pub fn pending(&self) -> Vec<ScheduledSend> {
        let mut out: Vec<ScheduledSend> = self
            .pending
            .iter()
            .map(|entry| ScheduledSend {
                send_id: entry.key().clone(),
                event: entry.event.clone(),
                due: entry.due,
            })
            .collect();
        out.sort_by(|a, b| a.due.cmp(&b.due).then_with(|| a.send_id.cmp(&b.send_id)));
        out
    }

    /// Re-arms persisted sends; overdue ones fire immediately.
    pub fn restore(&self, sends: Vec<ScheduledSend>) {
        let now = Utc::now();
        for send in sends {
            let delay = (send.due - now).to_std().unwrap_or(Duration::ZERO);
            self.schedule(send.send_id, send.event, delay);
        }
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }
}

impl std::fmt::Debug for DelayedSendScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedSendScheduler")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for DelayedSendScheduler {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.handle.abort();
        }
    }
}
