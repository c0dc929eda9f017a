//! Allocation Engine
//!
//! Admission control for every request:
//! 1. Reserve against the requester's quota (`QuotaExceeded` on failure).
//! 2. Reserve against the pool; on success issue a grant.
//! 3. Otherwise queue the request if it tolerates waiting, else reject it
//!    with `PoolExhausted` and roll the quota reservation back.
//!
//! Pool state and its wait queue share one lock, so a release's freed
//! capacity is visible to the very next admission check on that pool.
//! Quota locks are never held while a pool lock is taken.

use crate::error::{AllocError, AllocResult, PoolError, QuotaError};
use crate::events::{AllocationEvent, EventDispatcher, EventKind, EventSink};
use crate::model::{
    AllocationRequest, Grant, GrantHandle, GrantId, GrantStatus, PoolId, RejectReason, Rejection,
    RequestId, RequesterId, Resolution, UnitType,
};
use crate::pool::{PoolRegistry, PoolState, PoolStatus};
use crate::queue::Waiter;
use crate::quota::{QuotaPolicy, QuotaTracker, RequesterLimits, RequesterStatus};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Upper bound applied to wait tolerances and leases
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Outcome of `request`
#[derive(Debug)]
pub enum Admission {
    /// Capacity granted immediately
    Granted(Grant),
    /// Waiting for capacity; resolve through the handle
    Queued(QueuedHandle),
    /// Refused
    Rejected(Rejection),
}

impl Admission {
    pub fn grant(&self) -> Option<&Grant> {
        match self {
            Self::Granted(grant) => Some(grant),
            _ => None,
        }
    }

    pub fn rejection_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(rejection) => Some(rejection.reason),
            _ => None,
        }
    }

    pub fn into_queued(self) -> Option<QueuedHandle> {
        match self {
            Self::Queued(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Caller's view of a queued request.
///
/// Resolves to exactly one [`Resolution`]. Dropping the handle without
/// cancelling abandons the request; the engine discards it at dequeue time.
#[derive(Debug)]
pub struct QueuedHandle {
    request_id: RequestId,
    pool: PoolId,
    rx: oneshot::Receiver<Resolution>,
}

impl QueuedHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    /// Suspend until the request is granted, times out or is cancelled
    pub async fn wait(self) -> Resolution {
        self.rx
            .await
            .unwrap_or(Resolution::Rejected(RejectReason::Abandoned))
    }

    /// Block the current thread until resolution. Must not be called from
    /// inside an async runtime.
    pub fn wait_blocking(self) -> Resolution {
        self.rx
            .blocking_recv()
            .unwrap_or(Resolution::Rejected(RejectReason::Abandoned))
    }

    /// Non-blocking poll; `Some` once resolved
    pub fn try_resolution(&mut self) -> Option<Resolution> {
        match self.rx.try_recv() {
            Ok(resolution) => Some(resolution),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Resolution::Rejected(RejectReason::Abandoned)),
        }
    }
}

struct GrantRecord {
    grant: Grant,
    status: GrantStatus,
    deadline: Option<Instant>,
}

impl GrantRecord {
    fn is_due(&self, now: Instant) -> bool {
        self.status == GrantStatus::Active && self.deadline.map_or(false, |d| now >= d)
    }
}

/// Work produced under a pool lock, finished after the lock is released
#[derive(Default)]
struct DrainOutcome {
    granted: Vec<(Grant, Waiter)>,
    dropped: Vec<(Waiter, RejectReason)>,
}

enum Step {
    Grant(Grant),
    Queue(oneshot::Receiver<Resolution>),
    Reject(RejectReason),
}

/// The admission-control core
pub struct AllocationEngine {
    pools: PoolRegistry,
    quotas: QuotaTracker,
    grants: DashMap<GrantId, GrantRecord>,
    /// Queued request -> pool it waits on
    queued: DashMap<RequestId, PoolId>,
    events: Arc<EventDispatcher>,
    seq: AtomicU64,
}

impl AllocationEngine {
    pub fn new(policy: QuotaPolicy, events: Arc<EventDispatcher>) -> Self {
        Self {
            pools: PoolRegistry::new(),
            quotas: QuotaTracker::new(policy),
            grants: DashMap::new(),
            queued: DashMap::new(),
            events,
            seq: AtomicU64::new(0),
        }
    }

    /// Build an engine with its own dispatcher around `sink`
    pub fn with_sink(policy: QuotaPolicy, sink: Arc<dyn EventSink>, buffer_capacity: usize) -> Self {
        Self::new(policy, Arc::new(EventDispatcher::new(sink, buffer_capacity)))
    }

    /// Register a pool with all of its capacity available
    pub fn register_pool(&self, id: impl Into<PoolId>, total: u64, unit: UnitType) -> AllocResult<()> {
        let id = id.into();
        self.pools.register_pool(id.clone(), total, unit.clone())?;
        tracing::info!(pool = %id, total, unit = %unit, "pool registered");
        Ok(())
    }

    /// Change a pool's total capacity. Growing the pool drains its queue.
    pub fn resize_pool(&self, id: &PoolId, new_total: u64) -> AllocResult<()> {
        let now = Instant::now();
        let (before, outcome) = self.pools.with_pool(id, |state| {
            let before = state.total();
            state.resize(new_total)?;
            Ok::<_, PoolError>((before, self.drain_locked(state, now)))
        })??;

        tracing::info!(pool = %id, from = before, to = new_total, "pool resized");
        self.complete_drain(id, outcome);
        Ok(())
    }

    /// Submit a request: grant, queue or reject
    pub fn request(&self, req: AllocationRequest) -> Admission {
        let request_id = RequestId::new_v4();
        let now = Instant::now();

        if req.amount == 0 {
            return self.reject(request_id, &req, RejectReason::InvalidAmount);
        }
        if !self.pools.contains(&req.pool) {
            return self.reject(request_id, &req, RejectReason::UnknownPool);
        }

        if let Err(e) = self.quotas.check_and_reserve_at(&req.requester, req.amount, now) {
            let reason = match e {
                QuotaError::QuotaExceeded { limit, .. } => RejectReason::QuotaExceeded(limit),
                QuotaError::Suspended(_) | QuotaError::OverRelease { .. } => {
                    RejectReason::RequesterSuspended
                }
            };
            return self.reject(request_id, &req, reason);
        }

        let max_wait = req.max_wait.filter(|w| !w.is_zero());
        let step = self.pools.with_pool(&req.pool, |state| {
            if state.is_corrupted() {
                return (Step::Reject(RejectReason::PoolCorrupted), DrainOutcome::default());
            }
            // Dead heads must not block admission
            let drained = self.drain_locked(state, now);
            if req.amount > state.total() {
                return (Step::Reject(RejectReason::PoolExhausted), drained);
            }
            if state.waiters.admits_ahead(req.priority) && state.reserve(req.amount).is_ok() {
                let grant = self.issue_grant(request_id, state.id(), &req.requester, req.amount, req.lease, now);
                return (Step::Grant(grant), drained);
            }
            let step = match max_wait {
                Some(wait) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(Waiter {
                        request_id,
                        requester: req.requester.clone(),
                        amount: req.amount,
                        priority: req.priority,
                        seq: self.seq.fetch_add(1, Ordering::Relaxed),
                        submitted_at: now,
                        deadline: now + wait.min(MAX_DURATION),
                        lease: req.lease,
                        notify: tx,
                    });
                    self.queued.insert(request_id, req.pool.clone());
                    self.events.emit(AllocationEvent::new(
                        EventKind::Queued,
                        request_id,
                        &req.pool,
                        &req.requester,
                        req.amount,
                    ));
                    Step::Queue(rx)
                }
                None => Step::Reject(RejectReason::PoolExhausted),
            };
            (step, drained)
        });

        let step = step.map(|(step, drained)| {
            self.complete_drain(&req.pool, drained);
            step
        });

        match step {
            Ok(Step::Grant(grant)) => {
                tracing::debug!(request = %request_id, grant = %grant.id, pool = %req.pool,
                    requester = %req.requester, amount = req.amount, "request granted");
                Admission::Granted(grant)
            }
            Ok(Step::Queue(rx)) => {
                tracing::debug!(request = %request_id, pool = %req.pool, requester = %req.requester,
                    amount = req.amount, priority = req.priority, "request queued");
                Admission::Queued(QueuedHandle {
                    request_id,
                    pool: req.pool,
                    rx,
                })
            }
            Ok(Step::Reject(reason)) => {
                self.rollback_quota(&req.requester, req.amount);
                self.reject(request_id, &req, reason)
            }
            Err(_) => {
                self.rollback_quota(&req.requester, req.amount);
                self.reject(request_id, &req, RejectReason::UnknownPool)
            }
        }
    }

    /// Return a grant's capacity to its pool and its requester's quota
    pub fn release(&self, handle: GrantHandle) -> AllocResult<()> {
        let (_, record) = self
            .grants
            .remove(&handle.0)
            .ok_or(AllocError::AlreadyResolved)?;
        self.retire(record, GrantStatus::Released)
    }

    /// Withdraw a queued request. Fails with `AlreadyResolved` once the
    /// request has been granted or has left the queue.
    pub fn cancel(&self, request_id: RequestId) -> AllocResult<()> {
        let pool = self
            .queued
            .get(&request_id)
            .map(|entry| entry.value().clone())
            .ok_or(AllocError::AlreadyResolved)?;

        let now = Instant::now();
        let (waiter, mut outcome) = self
            .pools
            .with_pool(&pool, |state| {
                let waiter = state.waiters.remove(&request_id)?;
                self.queued.remove(&request_id);
                Some((waiter, self.drain_locked(state, now)))
            })?
            .ok_or(AllocError::AlreadyResolved)?;

        outcome.dropped.insert(0, (waiter, RejectReason::Cancelled));
        self.complete_drain(&pool, outcome);
        Ok(())
    }

    /// Snapshot of one pool
    pub fn pool_status(&self, id: &PoolId) -> Option<PoolStatus> {
        self.pools.status(id)
    }

    /// Snapshot of every pool
    pub fn pool_statuses(&self) -> Vec<PoolStatus> {
        self.pools.statuses()
    }

    /// Snapshot of one requester's quota usage
    pub fn requester_status(&self, id: &RequesterId) -> Option<RequesterStatus> {
        self.quotas.status(id)
    }

    /// Override a requester's limits at runtime
    pub fn set_requester_limits(&self, id: &RequesterId, limits: RequesterLimits) {
        self.quotas.set_limits(id, limits);
    }

    /// Look up an active grant
    pub fn grant(&self, handle: GrantHandle) -> Option<Grant> {
        self.grants.get(&handle.0).map(|r| r.grant.clone())
    }

    /// Active grants drawing on `pool`
    pub fn active_grants(&self, pool: &PoolId) -> Vec<Grant> {
        self.grants
            .iter()
            .filter(|r| &r.grant.pool == pool)
            .map(|r| r.grant.clone())
            .collect()
    }

    pub fn active_grant_count(&self) -> usize {
        self.grants.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Force-release every leased grant whose lease ran out by `now`
    pub(crate) fn expire_grants_at(&self, now: Instant) -> usize {
        let due: Vec<GrantId> = self
            .grants
            .iter()
            .filter(|r| r.is_due(now))
            .map(|r| *r.key())
            .collect();

        let mut expired = 0;
        for id in due {
            // A concurrent release may have won the race
            let Some((_, record)) = self.grants.remove_if(&id, |_, r| r.is_due(now)) else {
                continue;
            };
            expired += 1;
            if let Err(e) = self.retire(record, GrantStatus::Expired) {
                tracing::error!(grant = %id, error = %e, "failed to reclaim expired grant");
            }
        }
        expired
    }

    /// Forget requesters with no outstanding units and an empty rate window
    pub(crate) fn prune_requesters_at(&self, now: Instant) -> usize {
        self.quotas.prune_idle_at(now)
    }

    /// Drop queued requests past their max wait (and abandoned ones), then
    /// drain whatever capacity that unblocks
    pub(crate) fn expire_waiters_at(&self, now: Instant) -> usize {
        let mut timed_out = 0;
        for pool in self.pools.ids() {
            let outcome = self.pools.with_pool(&pool, |state| {
                let mut outcome = DrainOutcome::default();
                for waiter in state
                    .waiters
                    .remove_where(|w| w.is_expired(now) || w.is_abandoned())
                {
                    self.queued.remove(&waiter.request_id);
                    let reason = if waiter.is_expired(now) {
                        RejectReason::TimedOut
                    } else {
                        RejectReason::Abandoned
                    };
                    outcome.dropped.push((waiter, reason));
                }
                if !outcome.dropped.is_empty() {
                    let drained = self.drain_locked(state, now);
                    outcome.granted.extend(drained.granted);
                    outcome.dropped.extend(drained.dropped);
                }
                outcome
            });

            if let Ok(outcome) = outcome {
                timed_out += outcome
                    .dropped
                    .iter()
                    .filter(|(_, reason)| *reason == RejectReason::TimedOut)
                    .count();
                self.complete_drain(&pool, outcome);
            }
        }
        timed_out
    }

    fn reject(&self, request_id: RequestId, req: &AllocationRequest, reason: RejectReason) -> Admission {
        tracing::debug!(request = %request_id, pool = %req.pool, requester = %req.requester,
            amount = req.amount, reason = %reason, "request rejected");
        self.events.emit(
            AllocationEvent::new(EventKind::Rejected, request_id, &req.pool, &req.requester, req.amount)
                .with_reason(reason),
        );
        Admission::Rejected(Rejection { request_id, reason })
    }

    fn rollback_quota(&self, requester: &RequesterId, amount: u64) {
        if let Err(e) = self.quotas.release(requester, amount) {
            tracing::error!(requester = %requester, amount, error = %e, "quota rollback failed");
        }
    }

    /// Record a new active grant and emit its `Admitted` event. Called with
    /// the pool lock held, after the pool reservation succeeded, so the event
    /// precedes anything that can retire the grant.
    fn issue_grant(
        &self,
        request_id: RequestId,
        pool: &PoolId,
        requester: &RequesterId,
        amount: u64,
        lease: Option<Duration>,
        now: Instant,
    ) -> Grant {
        let lease = lease.map(|l| l.min(MAX_DURATION));
        let issued_at = Utc::now();
        let grant = Grant {
            id: GrantId::new_v4(),
            request_id,
            pool: pool.clone(),
            requester: requester.clone(),
            amount,
            issued_at,
            expires_at: lease
                .and_then(|l| chrono::Duration::from_std(l).ok())
                .map(|l| issued_at + l),
        };
        self.grants.insert(
            grant.id,
            GrantRecord {
                grant: grant.clone(),
                status: GrantStatus::Active,
                deadline: lease.map(|l| now + l),
            },
        );
        self.events.emit(
            AllocationEvent::new(EventKind::Admitted, request_id, pool, requester, amount).with_grant(grant.id),
        );
        grant
    }

    /// Give a removed grant's capacity back and drain the pool's queue.
    ///
    /// The `Released`/`Expired` event is only emitted once the pool has taken
    /// the capacity back. The requester's quota is refunded either way: a
    /// quarantined pool already reset its own accounting.
    fn retire(&self, mut record: GrantRecord, status: GrantStatus) -> AllocResult<()> {
        record.status = status;
        let grant = record.grant;
        let kind = match record.status {
            GrantStatus::Expired => EventKind::Expired,
            _ => EventKind::Released,
        };

        let now = Instant::now();
        let drained = self
            .pools
            .with_pool(&grant.pool, |state| {
                state.release(grant.amount)?;
                self.events.emit(
                    AllocationEvent::new(kind, grant.request_id, &grant.pool, &grant.requester, grant.amount)
                        .with_grant(grant.id),
                );
                Ok::<_, PoolError>(self.drain_locked(state, now))
            })
            .and_then(|inner| inner);
        let quota = self.quotas.release(&grant.requester, grant.amount);

        match &drained {
            Ok(_) => tracing::debug!(grant = %grant.id, pool = %grant.pool, requester = %grant.requester,
                amount = grant.amount, status = ?record.status, "grant retired"),
            Err(e) => tracing::error!(grant = %grant.id, pool = %grant.pool, amount = grant.amount,
                error = %e, "pool refused returned capacity"),
        }

        self.complete_drain(&grant.pool, drained?);
        quota?;
        Ok(())
    }

    /// Hand free capacity to waiters in queue order. Stops at the first live
    /// waiter that does not fit, so large requests are not starved by
    /// smaller ones behind them.
    fn drain_locked(&self, state: &mut PoolState, now: Instant) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let pool = state.id().clone();

        loop {
            let Some(head) = state.waiters.head() else {
                break;
            };
            let (expired, abandoned, amount) = (head.is_expired(now), head.is_abandoned(), head.amount);

            if expired || abandoned {
                if let Some(waiter) = state.waiters.pop_head() {
                    self.queued.remove(&waiter.request_id);
                    let reason = if expired {
                        RejectReason::TimedOut
                    } else {
                        RejectReason::Abandoned
                    };
                    outcome.dropped.push((waiter, reason));
                }
                continue;
            }

            if state.reserve(amount).is_err() {
                break;
            }
            let Some(waiter) = state.waiters.pop_head() else {
                break;
            };
            self.queued.remove(&waiter.request_id);
            let grant = self.issue_grant(
                waiter.request_id,
                &pool,
                &waiter.requester,
                waiter.amount,
                waiter.lease,
                now,
            );
            outcome.granted.push((grant, waiter));
        }
        outcome
    }

    /// Notify waiters and emit rejection events for work done under a pool
    /// lock
    fn complete_drain(&self, pool: &PoolId, outcome: DrainOutcome) {
        for (waiter, reason) in outcome.dropped {
            self.rollback_quota(&waiter.requester, waiter.amount);
            tracing::debug!(request = %waiter.request_id, pool = %pool, reason = %reason, "queued request dropped");
            self.events.emit(
                AllocationEvent::new(EventKind::Rejected, waiter.request_id, pool, &waiter.requester, waiter.amount)
                    .with_reason(reason),
            );
            let _ = waiter.notify.send(Resolution::Rejected(reason));
        }

        for (grant, waiter) in outcome.granted {
            tracing::debug!(request = %grant.request_id, grant = %grant.id, pool = %pool,
                waited_ms = waiter.submitted_at.elapsed().as_millis() as u64, "queued request granted");
            if waiter.notify.send(Resolution::Granted(grant.clone())).is_err() {
                tracing::debug!(grant = %grant.id, "waiter left before notification; releasing grant");
                match self.release(grant.handle()) {
                    Ok(()) | Err(AllocError::AlreadyResolved) => {}
                    Err(e) => tracing::error!(grant = %grant.id, error = %e, "failed to release orphaned grant"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::model::QuotaLimit;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn engine_with(policy: QuotaPolicy) -> (AllocationEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let engine = AllocationEngine::with_sink(policy, sink.clone(), 1024);
        engine.register_pool("gpu", 4, UnitType::Compute).unwrap();
        (engine, sink)
    }

    fn engine() -> (AllocationEngine, Arc<RecordingSink>) {
        engine_with(QuotaPolicy::default())
    }

    fn available(engine: &AllocationEngine, pool: &str) -> u64 {
        engine.pool_status(&pool.into()).unwrap().available
    }

    fn wait_req(requester: &str, amount: u64) -> AllocationRequest {
        AllocationRequest::new("gpu", requester, amount).with_max_wait(Duration::from_secs(1))
    }

    #[test]
    fn test_gpu_scenario() {
        let (engine, _) = engine();

        let g1 = engine
            .request(AllocationRequest::new("gpu", "r1", 3))
            .grant()
            .cloned()
            .unwrap();
        assert_eq!(g1.amount, 3);
        assert_eq!(available(&engine, "gpu"), 1);

        let mut h2 = engine.request(wait_req("r2", 2)).into_queued().unwrap();
        assert!(h2.try_resolution().is_none());

        engine.release(g1.handle()).unwrap();

        let resolution = h2.try_resolution().unwrap();
        let g2 = resolution.grant().unwrap();
        assert_eq!(g2.amount, 2);
        assert_eq!(g2.requester, RequesterId::from("r2"));
        assert_eq!(available(&engine, "gpu"), 2);
        assert_eq!(engine.queued_count(), 0);
    }

    #[test]
    fn test_fifo_within_priority() {
        let (engine, _) = engine();
        let h1 = engine.request(AllocationRequest::new("gpu", "holder", 2)).grant().cloned().unwrap();
        let _h2 = engine.request(AllocationRequest::new("gpu", "holder", 2)).grant().cloned().unwrap();

        let mut a = engine.request(wait_req("a", 2)).into_queued().unwrap();
        let mut b = engine.request(wait_req("b", 2)).into_queued().unwrap();

        engine.release(h1.handle()).unwrap();

        assert!(a.try_resolution().unwrap().grant().is_some());
        assert!(b.try_resolution().is_none());
        assert_eq!(engine.pool_status(&"gpu".into()).unwrap().queued, 1);
    }

    #[test]
    fn test_higher_priority_goes_first() {
        let (engine, _) = engine();
        let full = engine.request(AllocationRequest::new("gpu", "holder", 4)).grant().cloned().unwrap();

        let mut low = engine.request(wait_req("low", 4)).into_queued().unwrap();
        let mut high = engine.request(wait_req("high", 4).with_priority(9)).into_queued().unwrap();

        engine.release(full.handle()).unwrap();

        assert!(high.try_resolution().unwrap().grant().is_some());
        assert!(low.try_resolution().is_none());
    }

    #[test]
    fn test_outstanding_quota() {
        let policy = QuotaPolicy { max_outstanding: 10, ..QuotaPolicy::default() };
        let (engine, _) = engine_with(policy);
        engine.register_pool("cpu", 100, UnitType::Compute).unwrap();

        let first = engine.request(AllocationRequest::new("cpu", "r1", 6));
        assert!(first.grant().is_some());

        let second = engine.request(AllocationRequest::new("cpu", "r1", 6));
        assert_eq!(
            second.rejection_reason(),
            Some(RejectReason::QuotaExceeded(QuotaLimit::Outstanding))
        );
        assert_eq!(available(&engine, "cpu"), 94);
    }

    #[test]
    fn test_exhausted_without_wait_rolls_back_quota() {
        let (engine, _) = engine();
        engine.request(AllocationRequest::new("gpu", "holder", 4));

        let admission = engine.request(AllocationRequest::new("gpu", "r1", 1));
        assert_eq!(admission.rejection_reason(), Some(RejectReason::PoolExhausted));
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);
    }

    #[test]
    fn test_invalid_requests() {
        let (engine, _) = engine();

        let zero = engine.request(AllocationRequest::new("gpu", "r1", 0));
        assert_eq!(zero.rejection_reason(), Some(RejectReason::InvalidAmount));

        let unknown = engine.request(AllocationRequest::new("tpu", "r1", 1));
        assert_eq!(unknown.rejection_reason(), Some(RejectReason::UnknownPool));

        let too_big = engine.request(wait_req("r1", 5));
        assert_eq!(too_big.rejection_reason(), Some(RejectReason::PoolExhausted));
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);
    }

    #[test]
    fn test_new_request_does_not_jump_queue() {
        let (engine, _) = engine();
        engine.request(AllocationRequest::new("gpu", "holder", 3));
        let _waiter = engine.request(wait_req("big", 2)).into_queued().unwrap();

        let small = engine.request(AllocationRequest::new("gpu", "small", 1));
        assert_eq!(small.rejection_reason(), Some(RejectReason::PoolExhausted));

        let urgent = engine.request(AllocationRequest::new("gpu", "urgent", 1).with_priority(1));
        assert!(urgent.grant().is_some());
    }

    #[test]
    fn test_cancel() {
        let (engine, _) = engine();
        let holder = engine.request(AllocationRequest::new("gpu", "holder", 4)).grant().cloned().unwrap();
        let mut handle = engine.request(wait_req("r1", 2)).into_queued().unwrap();
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 2);

        engine.cancel(handle.request_id()).unwrap();
        assert_eq!(
            handle.try_resolution(),
            Some(Resolution::Rejected(RejectReason::Cancelled))
        );
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);
        assert_eq!(engine.cancel(handle.request_id()), Err(AllocError::AlreadyResolved));

        engine.release(holder.handle()).unwrap();
        assert_eq!(available(&engine, "gpu"), 4);
    }

    #[test]
    fn test_cancel_after_grant_is_noop() {
        let (engine, _) = engine();
        let holder = engine.request(AllocationRequest::new("gpu", "holder", 4)).grant().cloned().unwrap();
        let mut handle = engine.request(wait_req("r1", 2)).into_queued().unwrap();
        engine.release(holder.handle()).unwrap();

        assert!(handle.try_resolution().unwrap().grant().is_some());
        assert_eq!(engine.cancel(handle.request_id()), Err(AllocError::AlreadyResolved));
        assert_eq!(available(&engine, "gpu"), 2);
    }

    #[test]
    fn test_double_release() {
        let (engine, _) = engine();
        let grant = engine.request(AllocationRequest::new("gpu", "r1", 1)).grant().cloned().unwrap();

        engine.release(grant.handle()).unwrap();
        assert_eq!(engine.release(grant.handle()), Err(AllocError::AlreadyResolved));
        assert_eq!(available(&engine, "gpu"), 4);
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);
    }

    #[test]
    fn test_abandoned_waiter_is_discarded() {
        let (engine, _) = engine();
        let holder = engine.request(AllocationRequest::new("gpu", "holder", 4)).grant().cloned().unwrap();
        let handle = engine.request(wait_req("r1", 2)).into_queued().unwrap();
        drop(handle);

        engine.release(holder.handle()).unwrap();

        assert_eq!(available(&engine, "gpu"), 4);
        assert_eq!(engine.active_grant_count(), 0);
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);
    }

    #[test]
    fn test_resize_drains_queue() {
        let (engine, _) = engine();
        let gpu = PoolId::from("gpu");
        engine.request(AllocationRequest::new("gpu", "holder", 4));
        let mut handle = engine.request(wait_req("r1", 3)).into_queued().unwrap();

        assert_eq!(
            engine.resize_pool(&gpu, 2),
            Err(AllocError::Pool(PoolError::InvalidResize { pool: gpu.clone(), new_total: 2, in_use: 4 }))
        );

        engine.resize_pool(&gpu, 8).unwrap();
        assert!(handle.try_resolution().unwrap().grant().is_some());
        assert_eq!(available(&engine, "gpu"), 1);
    }

    #[test]
    fn test_corrupted_pool_refuses_allocation() {
        let (engine, _) = engine();
        let gpu = PoolId::from("gpu");
        assert!(engine.pools.release(&gpu, 1).is_err());

        let admission = engine.request(AllocationRequest::new("gpu", "r1", 1));
        assert_eq!(admission.rejection_reason(), Some(RejectReason::PoolCorrupted));
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);
    }

    #[test]
    fn test_abandoned_head_does_not_block_admission() {
        let (engine, _) = engine();
        engine.request(AllocationRequest::new("gpu", "holder", 3));
        let handle = engine
            .request(AllocationRequest::new("gpu", "w", 2).with_max_wait(Duration::from_millis(10)))
            .into_queued()
            .unwrap();
        drop(handle);
        std::thread::sleep(Duration::from_millis(20));

        let admission = engine.request(AllocationRequest::new("gpu", "r", 1));
        assert!(admission.grant().is_some());
        assert_eq!(available(&engine, "gpu"), 0);
        assert_eq!(engine.queued_count(), 0);
        assert_eq!(engine.requester_status(&"w".into()).unwrap().outstanding, 0);
    }

    #[test]
    fn test_expired_head_is_timed_out_on_admission() {
        let (engine, _) = engine();
        engine.request(AllocationRequest::new("gpu", "holder", 3));
        let mut handle = engine
            .request(AllocationRequest::new("gpu", "w", 2).with_max_wait(Duration::from_millis(10)))
            .into_queued()
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(engine.request(AllocationRequest::new("gpu", "r", 1)).grant().is_some());
        assert_eq!(
            handle.try_resolution(),
            Some(Resolution::Rejected(RejectReason::TimedOut))
        );
    }

    #[test]
    fn test_release_on_quarantined_pool() {
        let (engine, sink) = engine();
        let gpu = PoolId::from("gpu");
        let grant = engine.request(AllocationRequest::new("gpu", "r1", 1)).grant().cloned().unwrap();
        assert!(engine.pools.release(&gpu, 4).is_err());

        assert_eq!(
            engine.release(grant.handle()),
            Err(AllocError::Pool(PoolError::Corrupted(gpu.clone())))
        );
        assert_eq!(engine.active_grant_count(), 0);
        assert_eq!(engine.requester_status(&"r1".into()).unwrap().outstanding, 0);

        tokio_test::block_on(engine.events().flush());
        assert_eq!(sink.kinds(), vec![EventKind::Admitted]);
    }

    #[test]
    fn test_event_order_per_request_under_contention() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(AllocationEngine::with_sink(
            QuotaPolicy::default(),
            sink.clone(),
            16_384,
        ));
        engine.register_pool("slot", 1, UnitType::Compute).unwrap();
        let threads = 4;
        let barrier = Arc::new(std::sync::Barrier::new(threads));

        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        let req = AllocationRequest::new("slot", RequesterId::new(format!("worker-{t}")), 1)
                            .with_max_wait(Duration::from_secs(60));
                        let grant = match engine.request(req) {
                            Admission::Granted(grant) => Some(grant),
                            Admission::Queued(handle) => handle.wait_blocking().grant().cloned(),
                            Admission::Rejected(_) => None,
                        };
                        if let Some(grant) = grant {
                            engine.release(grant.handle()).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        tokio_test::block_on(engine.events().flush());
        assert_eq!(engine.events().stats().dropped, 0);

        let stage = |kind: EventKind| match kind {
            EventKind::Queued => 0,
            EventKind::Admitted => 1,
            EventKind::Released | EventKind::Expired | EventKind::Rejected => 2,
        };
        let mut last: HashMap<RequestId, u8> = HashMap::new();
        for event in sink.events() {
            let current = stage(event.kind);
            if let Some(previous) = last.insert(event.request_id, current) {
                assert!(
                    previous < current,
                    "{:?} arrived out of order for {}",
                    event.kind,
                    event.request_id
                );
            }
        }
        assert_eq!(last.len(), threads * 200);
    }

    #[test]
    fn test_event_sequence() {
        let (engine, sink) = engine();
        let grant = engine.request(AllocationRequest::new("gpu", "r1", 3)).grant().cloned().unwrap();
        let _handle = engine.request(wait_req("r2", 2)).into_queued().unwrap();
        engine.request(AllocationRequest::new("gpu", "r3", 0));
        engine.release(grant.handle()).unwrap();

        tokio_test::block_on(engine.events().flush());

        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::Admitted,
                EventKind::Queued,
                EventKind::Rejected,
                EventKind::Released,
                EventKind::Admitted,
            ]
        );
        let events = sink.events();
        assert_eq!(events[2].reason, Some(RejectReason::InvalidAmount));
        assert_eq!(events[3].grant_id, Some(grant.id));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let holder = engine.request(AllocationRequest::new("gpu", "holder", 4)).grant().cloned().unwrap();
        let handle = engine.request(wait_req("r1", 4)).into_queued().unwrap();

        let releaser = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release(holder.handle()).unwrap();
        });

        let resolution = handle.wait().await;
        assert_eq!(resolution.grant().unwrap().amount, 4);
    }

    #[test]
    fn test_blocking_wait() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let holder = engine.request(AllocationRequest::new("gpu", "holder", 4)).grant().cloned().unwrap();
        let handle = engine.request(wait_req("r1", 1)).into_queued().unwrap();

        let releaser = Arc::clone(&engine);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            releaser.release(holder.handle()).unwrap();
        });

        assert!(handle.wait_blocking().grant().is_some());
        thread.join().unwrap();
    }

    #[test]
    fn test_concurrent_reserve_release_stays_in_bounds() {
        let policy = QuotaPolicy {
            max_outstanding: u64::MAX,
            max_per_window: u64::MAX,
            ..QuotaPolicy::default()
        };
        let (engine, _) = engine_with(policy);
        engine.register_pool("shared", 10, UnitType::Compute).unwrap();
        let engine = Arc::new(engine);
        let shared = PoolId::from("shared");
        let threads = 8;
        let barrier = Arc::new(std::sync::Barrier::new(threads));

        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                let shared = shared.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..500u64 {
                        let amount = 1 + (i + t as u64) % 4;
                        let admission = engine.request(AllocationRequest::new(
                            shared.clone(),
                            RequesterId::new(format!("worker-{t}")),
                            amount,
                        ));
                        let status = engine.pool_status(&shared).unwrap();
                        assert!(status.available <= status.total);
                        if let Some(grant) = admission.grant() {
                            engine.release(grant.handle()).unwrap();
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let status = engine.pool_status(&shared).unwrap();
        assert_eq!(status.available, status.total);
        assert!(engine.active_grants(&shared).is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request { requester: u8, amount: u64, wait: bool, priority: u8 },
        Release(usize),
        Cancel(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 1u64..6, any::<bool>(), 0u8..3).prop_map(|(requester, amount, wait, priority)| {
                Op::Request { requester, amount, wait, priority }
            }),
            (0usize..16).prop_map(Op::Release),
            (0usize..16).prop_map(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_conservation(ops in prop::collection::vec(op(), 1..64)) {
            let sink = Arc::new(RecordingSink::default());
            let engine = AllocationEngine::with_sink(QuotaPolicy::default(), sink, 256);
            engine.register_pool("pool", 10, UnitType::Compute).unwrap();
            let pool = PoolId::from("pool");

            let mut grants: Vec<Grant> = Vec::new();
            let mut waiting: Vec<QueuedHandle> = Vec::new();

            for op in ops {
                match op {
                    Op::Request { requester, amount, wait, priority } => {
                        let mut req = AllocationRequest::new("pool", format!("r{requester}").as_str(), amount)
                            .with_priority(priority);
                        if wait {
                            req = req.with_max_wait(Duration::from_secs(60));
                        }
                        match engine.request(req) {
                            Admission::Granted(grant) => grants.push(grant),
                            Admission::Queued(handle) => waiting.push(handle),
                            Admission::Rejected(_) => {}
                        }
                    }
                    Op::Release(i) if !grants.is_empty() => {
                        let grant = grants.remove(i % grants.len());
                        prop_assert!(engine.release(grant.handle()).is_ok());
                    }
                    Op::Cancel(i) if !waiting.is_empty() => {
                        let handle = &waiting[i % waiting.len()];
                        let _ = engine.cancel(handle.request_id());
                    }
                    _ => {}
                }

                let mut still_waiting = Vec::new();
                for mut handle in waiting.drain(..) {
                    match handle.try_resolution() {
                        Some(Resolution::Granted(grant)) => grants.push(grant),
                        Some(Resolution::Rejected(_)) => {}
                        None => still_waiting.push(handle),
                    }
                }
                waiting = still_waiting;

                let status = engine.pool_status(&pool).unwrap();
                let active: u64 = engine.active_grants(&pool).iter().map(|g| g.amount).sum();
                prop_assert!(status.available <= status.total);
                prop_assert_eq!(status.available, status.total - active);
                prop_assert_eq!(active, grants.iter().map(|g| g.amount).sum::<u64>());

                let mut reserved: HashMap<RequesterId, u64> = HashMap::new();
                for grant in &grants {
                    *reserved.entry(grant.requester.clone()).or_default() += grant.amount;
                }
                for r in 0..3u8 {
                    let id = RequesterId::new(format!("r{r}"));
                    if let Some(quota) = engine.requester_status(&id) {
                        let held = reserved.get(&id).copied().unwrap_or(0);
                        prop_assert!(quota.outstanding >= held);
                    }
                }
            }
        }
    }
}
