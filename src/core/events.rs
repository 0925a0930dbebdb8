//! Session events and subscriber queues
//!
//! Every subscriber gets its own bounded queue. When a queue is full, the
//! newest pending event of the same kind is pulled out and folded into the
//! new one, which goes to the back (output regions are merged, the snapshot
//! and title are the newest). Slow renderers see fewer, larger updates, in
//! publish order, and always end on the latest screen state. `Exited` is
//! never folded.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use super::lock;
use super::pty::ExitCode;
pub use super::term::{DiffRegion, ScreenSnapshot};

/// Default per-subscriber queue bound
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Rows changed plus the screen state after the change
#[derive(Clone, Debug)]
pub struct ScreenUpdate {
    pub region: DiffRegion,
    pub snapshot: Arc<ScreenSnapshot>,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Screen contents changed
    OutputUpdated(ScreenUpdate),
    /// The program set a new window title
    TitleChanged(String),
    /// The process is gone; always the last event
    Exited(ExitCode),
}

struct QueueState {
    events: VecDeque<SessionEvent>,
    closed: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl Queue {
    fn push(&self, event: SessionEvent) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }

        if state.events.len() >= self.capacity {
            // Fold the newest pending event of the same kind into this one and
            // queue the result last, so nothing is delivered ahead of an
            // event that was published before it
            let same_kind = |pending: &SessionEvent| match (pending, &event) {
                (SessionEvent::OutputUpdated(_), SessionEvent::OutputUpdated(_)) => true,
                (SessionEvent::TitleChanged(_), SessionEvent::TitleChanged(_)) => true,
                _ => false,
            };
            let folded = state
                .events
                .iter()
                .rposition(same_kind)
                .and_then(|index| state.events.remove(index));
            let event = match (folded, event) {
                (Some(SessionEvent::OutputUpdated(older)), SessionEvent::OutputUpdated(mut update)) => {
                    let mut region = older.region;
                    region.merge(update.region);
                    update.region = region;
                    SessionEvent::OutputUpdated(update)
                }
                (_, event) => event,
            };
            state.events.push_back(event);
        } else {
            state.events.push_back(event);
        }
        self.ready.notify_all();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
    }
}

/// Fan-out point for one session's events
pub struct SubscriberHub {
    subscribers: Mutex<Vec<Weak<Queue>>>,
    capacity: usize,
    closed: Mutex<bool>,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            closed: Mutex::new(false),
        }
    }

    /// Register a new subscriber. It sees only events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let closed = *lock(&self.closed);
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed,
            }),
            ready: Condvar::new(),
            capacity: self.capacity,
        });
        if !closed {
            lock(&self.subscribers).push(Arc::downgrade(&queue));
        }
        Subscription { queue }
    }

    /// Deliver an event to every live subscriber, dropping cancelled ones
    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone());
                true
            }
            None => false,
        });
    }

    /// End every stream once its pending events are consumed
    pub fn close(&self) {
        *lock(&self.closed) = true;
        for queue in lock(&self.subscribers).drain(..).filter_map(|weak| weak.upgrade()) {
            queue.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// One subscriber's view of a session's events.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    queue: Arc<Queue>,
}

impl Subscription {
    /// Block until the next event; `None` once the session has exited and
    /// everything queued has been consumed
    pub fn recv(&self) -> Option<SessionEvent> {
        let mut state = lock(&self.queue.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            state = self
                .queue
                .ready
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.queue.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if state.closed || now >= deadline {
                return None;
            }
            state = self
                .queue
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    pub fn try_recv(&self) -> Option<SessionEvent> {
        lock(&self.queue.state).events.pop_front()
    }

    /// True once the stream has ended and nothing is left to read
    pub fn is_finished(&self) -> bool {
        let state = lock(&self.queue.state);
        state.closed && state.events.is_empty()
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue.state).events.len()
    }
}

impl Iterator for Subscription {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<SessionEvent> {
        self.recv()
    }
}
