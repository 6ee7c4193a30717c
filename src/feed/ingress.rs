// =============================================================================
// Per-processor ingress queue
// =============================================================================
//
// Bounded event queue between the feed dispatcher and one display's processor
// task. The dispatcher side never blocks: pushing into a full queue drops the
// oldest queued tick and bumps a shared counter. Control events (init, error)
// survive overflow; only ticks are sacrificed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::FeedError;
use crate::types::Tick;

use super::protocol::SnapshotFrame;

/// Everything the feed manager delivers to a display's processor task.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Initial (or refreshed) instrument snapshot; triggers processor init.
    Initialized(SnapshotFrame),
    Tick(Tick),
    Error(FeedError),
}

struct Shared {
    queue: Mutex<VecDeque<FeedEvent>>,
    notify: Notify,
    capacity: usize,
    senders: AtomicUsize,
    closed: AtomicBool,
    dropped_ticks: Arc<AtomicU64>,
}

/// Create a bounded ingress channel. `dropped_ticks` is shared so the feed
/// manager can aggregate drop counts across all queues.
pub fn channel(capacity: usize, dropped_ticks: Arc<AtomicU64>) -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        senders: AtomicUsize::new(1),
        closed: AtomicBool::new(false),
        dropped_ticks,
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Non-blocking enqueue. Returns false once the receiver is gone.
    pub fn send(&self, event: FeedEvent) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                // Sacrifice the oldest tick; control events are kept.
                if let Some(pos) = queue.iter().position(|e| matches!(e, FeedEvent::Tick(_))) {
                    queue.remove(pos);
                    self.shared.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                } else {
                    queue.pop_front();
                }
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
        true
    }
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.notify.notify_one();
        }
    }
}

pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// Await the next event. Returns `None` once every sender is gone and the
    /// queue has drained.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            if let Some(event) = self.shared.queue.lock().pop_front() {
                return Some(event);
            }
            if self.shared.senders.load(Ordering::Acquire) == 0 {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.shared.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.queue.lock().clear();
    }
}
