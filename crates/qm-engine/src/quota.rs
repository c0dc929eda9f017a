//! Quota Tracker
//!
//! Per-requester outstanding totals and sliding-window admission rate.
//! Window counters decay lazily from timestamps on each check; there is no
//! background sweep.

use crate::error::QuotaError;
use crate::model::{QuotaLimit, RequesterId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How admissions are weighed against the rate window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateMode {
    /// Each admission counts as one
    #[default]
    Count,
    /// Each admission counts as its requested amount
    Volume,
}

/// Limits applied to one requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterLimits {
    /// Ceiling on the sum of active (and queued) reservations
    pub max_outstanding: u64,
    /// Admissions (or volume) allowed per window
    pub max_per_window: u64,
}

/// Quota policy shared by all requesters, with per-requester overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    /// Default outstanding ceiling
    pub max_outstanding: u64,
    /// Sliding window length in milliseconds
    pub rate_window_ms: u64,
    /// Default admissions per window
    pub max_per_window: u64,
    /// Count or volume weighting
    pub rate_mode: RateMode,
    /// Requester-specific limits
    pub overrides: HashMap<RequesterId, RequesterLimits>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_outstanding: 1000,
            rate_window_ms: 60_000,
            max_per_window: 1000,
            rate_mode: RateMode::Count,
            overrides: HashMap::new(),
        }
    }
}

impl QuotaPolicy {
    /// Limits for a requester, falling back to the defaults
    pub fn limits_for(&self, requester: &RequesterId) -> RequesterLimits {
        self.overrides.get(requester).copied().unwrap_or(RequesterLimits {
            max_outstanding: self.max_outstanding,
            max_per_window: self.max_per_window,
        })
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

/// Read-only snapshot of a requester's quota state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterStatus {
    pub requester: RequesterId,
    /// Units reserved by active grants and queued requests
    pub outstanding: u64,
    /// Usage inside the current rate window
    pub rate_window_usage: u64,
    pub limits: RequesterLimits,
    pub suspended: bool,
}

/// Sliding window log of admissions
struct SlidingWindow {
    window: Duration,
    admissions: VecDeque<(Instant, u64)>,
    total: u64,
}

impl SlidingWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            admissions: VecDeque::new(),
            total: 0,
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, weight)) = self.admissions.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.admissions.pop_front();
            self.total -= weight;
        }
    }

    fn usage(&mut self, now: Instant) -> u64 {
        self.evict(now);
        self.total
    }

    fn record(&mut self, now: Instant, weight: u64) {
        self.admissions.push_back((now, weight));
        self.total += weight;
    }
}

struct RequesterQuota {
    limits: RequesterLimits,
    outstanding: u64,
    window: SlidingWindow,
    suspended: bool,
}

impl RequesterQuota {
    /// Nothing here that a freshly created entry would not reproduce
    fn is_idle(&mut self, now: Instant, default_limits: RequesterLimits) -> bool {
        !self.suspended
            && self.outstanding == 0
            && self.limits == default_limits
            && self.window.usage(now) == 0
    }
}

/// Quota tracker; each requester's state sits behind its own lock
pub struct QuotaTracker {
    policy: QuotaPolicy,
    requesters: DashMap<RequesterId, Arc<Mutex<RequesterQuota>>>,
}

impl QuotaTracker {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self {
            policy,
            requesters: DashMap::new(),
        }
    }

    /// Check both limits and, if they hold, reserve `amount` against the
    /// requester's outstanding total and record the admission in its window.
    pub fn check_and_reserve(&self, requester: &RequesterId, amount: u64) -> Result<(), QuotaError> {
        self.check_and_reserve_at(requester, amount, Instant::now())
    }

    pub(crate) fn check_and_reserve_at(
        &self,
        requester: &RequesterId,
        amount: u64,
        now: Instant,
    ) -> Result<(), QuotaError> {
        let slot = self.slot(requester);
        let mut quota = slot.lock();

        if quota.suspended {
            return Err(QuotaError::Suspended(requester.clone()));
        }

        let next = quota.outstanding.saturating_add(amount);
        if next > quota.limits.max_outstanding {
            return Err(QuotaError::QuotaExceeded {
                requester: requester.clone(),
                limit: QuotaLimit::Outstanding,
            });
        }

        let weight = match self.policy.rate_mode {
            RateMode::Count => 1,
            RateMode::Volume => amount,
        };
        if quota.window.usage(now).saturating_add(weight) > quota.limits.max_per_window {
            return Err(QuotaError::QuotaExceeded {
                requester: requester.clone(),
                limit: QuotaLimit::Rate,
            });
        }

        quota.outstanding = next;
        quota.window.record(now, weight);
        Ok(())
    }

    /// Return `amount` units to the requester's outstanding total.
    /// Going below zero quarantines the requester.
    pub fn release(&self, requester: &RequesterId, amount: u64) -> Result<(), QuotaError> {
        let slot = self
            .requesters
            .get(requester)
            .map(|entry| Arc::clone(entry.value()));
        let Some(slot) = slot else {
            tracing::error!(requester = %requester, amount, "release for unknown requester");
            return Err(QuotaError::OverRelease {
                requester: requester.clone(),
                amount,
                outstanding: 0,
            });
        };

        let mut quota = slot.lock();
        if quota.suspended {
            return Err(QuotaError::Suspended(requester.clone()));
        }
        if amount > quota.outstanding {
            tracing::error!(requester = %requester, amount, outstanding = quota.outstanding,
                "quota over-release detected; requester suspended");
            let err = QuotaError::OverRelease {
                requester: requester.clone(),
                amount,
                outstanding: quota.outstanding,
            };
            quota.outstanding = 0;
            quota.suspended = true;
            return Err(err);
        }
        quota.outstanding -= amount;
        drop(quota);
        drop(slot);
        self.prune(requester, Instant::now());
        Ok(())
    }

    /// Forget every requester whose state is indistinguishable from a new
    /// one. Returns the number of entries removed.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub(crate) fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.requesters.len();
        self.requesters
            .retain(|requester, slot| !self.is_prunable(requester, slot, now));
        let pruned = before.saturating_sub(self.requesters.len());
        if pruned > 0 {
            tracing::debug!(pruned, remaining = self.requesters.len(), "pruned idle requesters");
        }
        pruned
    }

    /// Requesters currently tracked
    pub fn len(&self) -> usize {
        self.requesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requesters.is_empty()
    }

    /// Replace the limits of one requester at runtime
    pub fn set_limits(&self, requester: &RequesterId, limits: RequesterLimits) {
        self.slot(requester).lock().limits = limits;
    }

    /// Snapshot of one requester; `None` if it never submitted anything
    pub fn status(&self, requester: &RequesterId) -> Option<RequesterStatus> {
        self.status_at(requester, Instant::now())
    }

    pub(crate) fn status_at(&self, requester: &RequesterId, now: Instant) -> Option<RequesterStatus> {
        let slot = self.requesters.get(requester).map(|e| Arc::clone(e.value()))?;
        let mut quota = slot.lock();
        Some(RequesterStatus {
            requester: requester.clone(),
            outstanding: quota.outstanding,
            rate_window_usage: quota.window.usage(now),
            limits: quota.limits,
            suspended: quota.suspended,
        })
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    fn prune(&self, requester: &RequesterId, now: Instant) {
        self.requesters
            .remove_if(requester, |id, slot| self.is_prunable(id, slot, now));
    }

    /// Called with the entry's shard write-locked. A strong count of one
    /// means no caller holds the slot, and none can clone it until the shard
    /// is released.
    fn is_prunable(&self, requester: &RequesterId, slot: &Arc<Mutex<RequesterQuota>>, now: Instant) -> bool {
        if Arc::strong_count(slot) != 1 {
            return false;
        }
        slot.try_lock()
            .map_or(false, |mut quota| quota.is_idle(now, self.policy.limits_for(requester)))
    }

    fn slot(&self, requester: &RequesterId) -> Arc<Mutex<RequesterQuota>> {
        let entry = self.requesters.entry(requester.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(RequesterQuota {
                limits: self.policy.limits_for(requester),
                outstanding: 0,
                window: SlidingWindow::new(self.policy.rate_window()),
                suspended: false,
            }))
        });
        Arc::clone(entry.value())
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(QuotaPolicy::default())
    }
}
