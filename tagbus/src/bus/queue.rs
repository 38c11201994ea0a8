//! Bounded outbound queue with per-tag coalescing.
//!
//! Consistent with by-exception delivery, only the newest pending value
//! per tag matters: a push for a tag that already has a queued update
//! replaces it in place. The queue length is bounded by the number of
//! distinct tags with pending traffic, capped at `capacity`; past the
//! cap the oldest queued tag is dropped with a warning.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::Value;

/// A pending SET for one tag.
#[derive(Debug, Clone)]
pub struct QueuedSet {
    pub value: Value,
    pub time_us: u64,
}

pub struct CoalescingQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    order: VecDeque<String>,
    latest: HashMap<String, QueuedSet>,
}

impl CoalescingQueue {
    pub fn new(capacity: usize) -> CoalescingQueue {
        CoalescingQueue {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                latest: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a SET for `name`, replacing any update already pending for
    /// the same tag.
    pub fn push(&self, name: &str, set: QueuedSet) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.latest.insert(name.to_owned(), set).is_none() {
            if inner.order.len() >= self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.latest.remove(&evicted);
                    warn!(tag = %evicted, "outbound queue full, dropping oldest update");
                }
            }
            inner.order.push_back(name.to_owned());
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<(String, QueuedSet)> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let name = inner.order.pop_front()?;
        let set = inner.latest.remove(&name)?;
        Some((name, set))
    }

    /// Wait for the next queued update. Cancel-safe: an update is only
    /// removed in the synchronous `try_pop` step.
    pub async fn pop(&self) -> (String, QueuedSet) {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
