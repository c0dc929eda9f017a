//! Pool Registry
//!
//! Named capacity buckets, each behind its own lock. All mutation of a
//! pool's `available` counter goes through [`PoolState`], which enforces
//! `0 <= available <= total`.

use crate::error::PoolError;
use crate::model::{PoolId, UnitType};
use crate::queue::WaitQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Read-only snapshot of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub id: PoolId,
    pub unit: UnitType,
    pub total: u64,
    pub available: u64,
    /// Requests waiting for capacity
    pub queued: usize,
    /// Units requested by waiting requests
    pub queued_amount: u64,
    /// Quarantined after an accounting violation
    pub corrupted: bool,
}

impl PoolStatus {
    /// Units currently granted
    pub fn in_use(&self) -> u64 {
        self.total - self.available
    }

    /// Granted share of total capacity (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.in_use() as f64 / self.total as f64
    }
}

/// Mutable state of one pool, guarded by the registry's per-pool lock
pub(crate) struct PoolState {
    id: PoolId,
    unit: UnitType,
    total: u64,
    available: u64,
    corrupted: bool,
    pub(crate) waiters: WaitQueue,
}

impl PoolState {
    fn new(id: PoolId, total: u64, unit: UnitType) -> Self {
        Self {
            id,
            unit,
            total,
            available: total,
            corrupted: false,
            waiters: WaitQueue::new(),
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Take `amount` units, or fail without mutating
    pub fn reserve(&mut self, amount: u64) -> Result<(), PoolError> {
        if self.corrupted {
            return Err(PoolError::Corrupted(self.id.clone()));
        }
        if amount > self.available {
            return Err(PoolError::InsufficientCapacity {
                pool: self.id.clone(),
                requested: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        Ok(())
    }

    /// Return `amount` units. Returning more than was taken clamps
    /// `available` to `total` and quarantines the pool.
    pub fn release(&mut self, amount: u64) -> Result<(), PoolError> {
        if self.corrupted {
            return Err(PoolError::Corrupted(self.id.clone()));
        }
        match self.available.checked_add(amount) {
            Some(next) if next <= self.total => {
                self.available = next;
                Ok(())
            }
            _ => {
                let err = PoolError::OverRelease {
                    pool: self.id.clone(),
                    amount,
                    available: self.available,
                    total: self.total,
                };
                tracing::error!(pool = %self.id, amount, available = self.available, total = self.total,
                    "over-release detected; pool quarantined");
                self.available = self.total;
                self.corrupted = true;
                Err(err)
            }
        }
    }

    /// Change total capacity, keeping granted units granted
    pub fn resize(&mut self, new_total: u64) -> Result<(), PoolError> {
        if self.corrupted {
            return Err(PoolError::Corrupted(self.id.clone()));
        }
        let in_use = self.total - self.available;
        if new_total < in_use {
            return Err(PoolError::InvalidResize {
                pool: self.id.clone(),
                new_total,
                in_use,
            });
        }
        self.total = new_total;
        self.available = new_total - in_use;
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            id: self.id.clone(),
            unit: self.unit.clone(),
            total: self.total,
            available: self.available,
            queued: self.waiters.len(),
            queued_amount: self.waiters.queued_amount(),
            corrupted: self.corrupted,
        }
    }
}

/// Registry of pools keyed by id. Pools are independent: operations on
/// different pools never contend on the same lock.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<PoolId, Arc<Mutex<PoolState>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pool with all capacity available
    pub fn register_pool(&self, id: PoolId, total: u64, unit: UnitType) -> Result<(), PoolError> {
        match self.pools.entry(id.clone()) {
            Entry::Occupied(_) => Err(PoolError::PoolExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(PoolState::new(id, total, unit))));
                Ok(())
            }
        }
    }

    /// Change a pool's total capacity
    pub fn resize(&self, id: &PoolId, new_total: u64) -> Result<(), PoolError> {
        self.with_pool(id, |state| state.resize(new_total))?
    }

    /// Atomically take `amount` units from a pool
    pub fn reserve(&self, id: &PoolId, amount: u64) -> Result<(), PoolError> {
        self.with_pool(id, |state| state.reserve(amount))?
    }

    /// Atomically return `amount` units to a pool
    pub fn release(&self, id: &PoolId, amount: u64) -> Result<(), PoolError> {
        self.with_pool(id, |state| state.release(amount))?
    }

    /// Snapshot of one pool
    pub fn status(&self, id: &PoolId) -> Option<PoolStatus> {
        self.with_pool(id, |state| state.status()).ok()
    }

    /// Snapshot of every pool, ordered by id
    pub fn statuses(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<_> = self.ids().iter().filter_map(|id| self.status(id)).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn contains(&self, id: &PoolId) -> bool {
        self.pools.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<PoolId> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    /// Run `f` with exclusive access to one pool. The map shard is released
    /// before the pool lock is taken.
    pub(crate) fn with_pool<R>(
        &self,
        id: &PoolId,
        f: impl FnOnce(&mut PoolState) -> R,
    ) -> Result<R, PoolError> {
        let slot = self
            .pools
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PoolError::UnknownPool(id.clone()))?;
        let mut state = slot.lock();
        let result = f(&mut state);
        debug_assert!(state.available <= state.total);
        Ok(result)
    }
}
