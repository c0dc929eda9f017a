//! Per-pool wait queue
//!
//! Waiters are ordered by priority (highest first) and, within a priority
//! tier, by submission sequence (earliest first). The queue lives inside
//! the pool's lock, so ordering and capacity checks are linearized.

use crate::model::{RequestId, RequesterId, Resolution};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A request parked until capacity frees up
pub(crate) struct Waiter {
    pub request_id: RequestId,
    pub requester: RequesterId,
    pub amount: u64,
    pub priority: u8,
    pub seq: u64,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub lease: Option<Duration>,
    pub notify: oneshot::Sender<Resolution>,
}

impl Waiter {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// The caller dropped its handle
    pub fn is_abandoned(&self) -> bool {
        self.notify.is_closed()
    }

    fn key(&self) -> WaitKey {
        WaitKey {
            priority: Reverse(self.priority),
            seq: self.seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WaitKey {
    priority: Reverse<u8>,
    seq: u64,
}

/// Priority queue with removal by request id
#[derive(Default)]
pub(crate) struct WaitQueue {
    entries: BTreeMap<WaitKey, Waiter>,
    index: HashMap<RequestId, WaitKey>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, waiter: Waiter) {
        let key = waiter.key();
        self.index.insert(waiter.request_id, key);
        self.entries.insert(key, waiter);
    }

    pub fn head(&self) -> Option<&Waiter> {
        self.entries.values().next()
    }

    pub fn pop_head(&mut self) -> Option<Waiter> {
        let (_, waiter) = self.entries.pop_first()?;
        self.index.remove(&waiter.request_id);
        Some(waiter)
    }

    pub fn remove(&mut self, request_id: &RequestId) -> Option<Waiter> {
        let key = self.index.remove(request_id)?;
        self.entries.remove(&key)
    }

    /// Whether a newly submitted request at `priority` would sort ahead of
    /// every current waiter. Sequence numbers are drawn under the pool lock,
    /// so a new request sorts after every waiter of equal priority and only
    /// a strictly higher priority can overtake the head.
    pub fn admits_ahead(&self, priority: u8) -> bool {
        self.head().map_or(true, |head| priority > head.priority)
    }

    /// Remove every waiter matching `pred`, in queue order
    pub fn remove_where(&mut self, pred: impl Fn(&Waiter) -> bool) -> Vec<Waiter> {
        let matched: Vec<WaitKey> = self
            .entries
            .iter()
            .filter(|(_, w)| pred(w))
            .map(|(k, _)| *k)
            .collect();

        matched
            .into_iter()
            .filter_map(|key| {
                let waiter = self.entries.remove(&key)?;
                self.index.remove(&waiter.request_id);
                Some(waiter)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Units requested by everyone waiting
    pub fn queued_amount(&self) -> u64 {
        self.entries.values().map(|w| w.amount).sum()
    }
}
