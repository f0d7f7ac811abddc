//! Internal and external event queues.

use crate::cancel::CancelSignal;
use crate::config::BackpressurePolicy;
use harel_model::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("external queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("external queue is closed")]
    Closed,

    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

/// Events raised by the session itself. Touched only by the run loop.
#[derive(Debug, Clone, Default)]
pub struct InternalQueue {
    events: VecDeque<Event>,
}

impl InternalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        Self {
            events: events.into(),
        }
    }

    pub fn enqueue(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn dequeue(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Thread-safe queue feeding a session from the outside world.
#[derive(Debug)]
pub struct ExternalQueue {
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    capacity: Option<usize>,
    policy: BackpressurePolicy,
}

impl ExternalQueue {
    pub fn unbounded() -> Self {
        Self::new(None, BackpressurePolicy::Reject)
    }

    pub fn new(capacity: Option<usize>, policy: BackpressurePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Enqueues without waiting; a full queue is an error under either policy.
    pub fn try_enqueue(&self, event: Event) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if let Some(capacity) = self.capacity {
                if state.events.len() >= capacity {
                    return Err(QueueError::Full { capacity });
                }
            }
            state.events.push_back(event);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Enqueues, waiting for room when the policy is `Block`.
    pub async fn enqueue(&self, event: Event) -> Result<(), QueueError> {
        let mut event = Some(event);
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                let full = self
                    .capacity
                    .map(|capacity| state.events.len() >= capacity)
                    .unwrap_or(false);
                if !full {
                    if let Some(event) = event.take() {
                        state.events.push_back(event);
                    }
                    drop(state);
                    self.readable.notify_one();
                    return Ok(());
                }
                if self.policy == BackpressurePolicy::Reject {
                    return Err(QueueError::Full {
                        capacity: self.capacity.unwrap_or_default(),
                    });
                }
            }
            self.writable.notified().await;
        }
    }

    /// Waits for the next event. `None` on cancellation or when the queue is
    /// closed and drained.
    pub async fn dequeue(&self, cancel: &CancelSignal) -> Option<Event> {
        loop {
            if let Some(event) = self.try_dequeue() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = self.readable.notified() => {}
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<Event> {
        let event = self.state.lock().events.pop_front();
        if event.is_some() {
            self.writable.notify_one();
        }
        event
    }

    /// Rejects further enqueues and wakes every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Puts restored events back ahead of anything enqueued since, ignoring
    /// capacity.
    pub fn restore(&self, events: Vec<Event>) {
        {
            let mut state = self.state.lock();
            for event in events.into_iter().rev() {
                state.events.push_front(event);
            }
        }
        self.readable.notify_one();
    }
}
