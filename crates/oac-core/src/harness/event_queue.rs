//! The sole synchronization primitive between the stream-parsing tasks
//! and an adapter's single consumer (§4.2 "Event queue").
//!
//! An unbounded in-memory queue with a waiter list: `push` wakes the
//! oldest pending waiter; `close` signals end-of-stream; `fail` causes
//! the next waiter to observe an error. Justified unbounded because the
//! subprocess is the rate limiter and the per-job timeout bounds total
//! volume (§5 Backpressure) -- adapters must still read line-by-line and
//! never spool unbounded byte buffers upstream of this queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use super::types::AgentEvent;
use crate::error::OacError;

enum Slot {
    Event(AgentEvent),
    Closed,
    Failed(OacError),
}

struct Inner {
    items: VecDeque<Slot>,
    /// Once true, no more events will ever be pushed; `items` may still
    /// hold buffered events to drain.
    terminal_queued: bool,
}

/// Single-producer(s)/single-consumer event queue. Concurrent consumers
/// observe undefined order, matching the adapter contract.
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), terminal_queued: false }),
            notify: Notify::new(),
        }
    }

    /// Push one event. No-op after the queue has been closed or failed.
    pub fn push(&self, event: AgentEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_queued {
            return;
        }
        inner.items.push_back(Slot::Event(event));
        drop(inner);
        self.notify.notify_one();
    }

    /// Signal a clean end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_queued {
            return;
        }
        inner.items.push_back(Slot::Closed);
        inner.terminal_queued = true;
        drop(inner);
        self.notify.notify_one();
    }

    /// Signal that the stream terminated abnormally; the next `next()`
    /// call observes this as an error. Idempotent.
    pub fn fail(&self, err: OacError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_queued {
            return;
        }
        inner.items.push_back(Slot::Failed(err));
        inner.terminal_queued = true;
        drop(inner);
        self.notify.notify_one();
    }

    /// Pop the next event. Returns `Ok(None)` once the queue has been
    /// closed and fully drained.
    pub async fn next(&self) -> Result<Option<AgentEvent>, OacError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(slot) = inner.items.pop_front() {
                    return match slot {
                        Slot::Event(e) => Ok(Some(e)),
                        Slot::Closed => Ok(None),
                        Slot::Failed(err) => Err(err),
                    };
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
