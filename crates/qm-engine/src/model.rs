//! Core domain types: identifiers, requests, grants and outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Name of a resource pool (e.g. `"gpu"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    /// Create a pool id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PoolId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a requester, as resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(String);

impl RequesterId {
    /// Create a requester id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying identity
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequesterId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique id assigned to every submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique id of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(Uuid);

impl GrantId {
    pub(crate) fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of capacity a pool hands out
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    /// Compute units (cores, GPUs, slots)
    #[default]
    Compute,
    /// Storage capacity
    Storage,
    /// Anything else, named by the operator
    Custom(String),
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => f.write_str("compute"),
            Self::Storage => f.write_str("storage"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// A request for capacity, as submitted by a caller.
///
/// Requests without `max_wait` (or with a zero wait) are never queued:
/// they are granted immediately or rejected with
/// [`RejectReason::PoolExhausted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Target pool
    pub pool: PoolId,
    /// Who is asking
    pub requester: RequesterId,
    /// Units requested
    pub amount: u64,
    /// Higher is more urgent
    pub priority: u8,
    /// How long the request may wait in the pool's queue
    pub max_wait: Option<Duration>,
    /// Lease duration of the resulting grant
    pub lease: Option<Duration>,
}

impl AllocationRequest {
    /// Build a request with default priority, no wait tolerance and no lease
    pub fn new(pool: impl Into<PoolId>, requester: impl Into<RequesterId>, amount: u64) -> Self {
        Self {
            pool: pool.into(),
            requester: requester.into(),
            amount,
            priority: 0,
            max_wait: None,
            lease: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Allow the request to queue for up to `max_wait`
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Attach a lease to the grant
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// An active allocation of capacity.
///
/// The engine owns the grant; callers hold it by [`GrantHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Grant id
    pub id: GrantId,
    /// Request that produced this grant
    pub request_id: RequestId,
    /// Pool the capacity came from
    pub pool: PoolId,
    /// Holder
    pub requester: RequesterId,
    /// Units held
    pub amount: u64,
    /// When the grant was issued
    pub issued_at: DateTime<Utc>,
    /// When the lease runs out, if any
    pub expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    /// Opaque handle used to release this grant
    pub fn handle(&self) -> GrantHandle {
        GrantHandle(self.id)
    }
}

/// Opaque reference to a grant held by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantHandle(pub(crate) GrantId);

impl GrantHandle {
    /// Id of the referenced grant
    pub fn id(&self) -> GrantId {
        self.0
    }
}

/// Grant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Capacity is held
    Active,
    /// Returned by the holder
    Released,
    /// Lease ran out and the lifecycle manager reclaimed it
    Expired,
}

/// Which per-requester limit refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimit {
    /// Sum of active grants would exceed the ceiling
    Outstanding,
    /// Too many admissions inside the sliding window
    Rate,
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outstanding => f.write_str("outstanding"),
            Self::Rate => f.write_str("rate"),
        }
    }
}

/// Why a request ended in `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A per-requester limit would be violated
    QuotaExceeded(QuotaLimit),
    /// No capacity and no wait tolerance, or more than the pool can ever hold
    PoolExhausted,
    /// Waited longer than `max_wait`
    TimedOut,
    /// Cancelled by the requester while queued
    Cancelled,
    /// No such pool
    UnknownPool,
    /// Amount must be positive
    InvalidAmount,
    /// Pool is quarantined after an accounting violation
    PoolCorrupted,
    /// Requester is quarantined after an accounting violation
    RequesterSuspended,
    /// The caller dropped its queued handle before resolution
    Abandoned,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded(limit) => write!(f, "quota exceeded ({limit})"),
            Self::PoolExhausted => f.write_str("pool exhausted"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::UnknownPool => f.write_str("unknown pool"),
            Self::InvalidAmount => f.write_str("invalid amount"),
            Self::PoolCorrupted => f.write_str("pool corrupted"),
            Self::RequesterSuspended => f.write_str("requester suspended"),
            Self::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// Terminal rejection returned synchronously from `request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Id assigned to the rejected request
    pub request_id: RequestId,
    /// Why
    pub reason: RejectReason,
}

/// Final outcome of a queued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Capacity was granted
    Granted(Grant),
    /// The request left the queue without a grant
    Rejected(RejectReason),
}

impl Resolution {
    /// The grant, if one was issued
    pub fn grant(&self) -> Option<&Grant> {
        match self {
            Self::Granted(grant) => Some(grant),
            Self::Rejected(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_type_serde() {
        assert_eq!(serde_json::to_string(&UnitType::Storage).unwrap(), "\"storage\"");
        let custom: UnitType = serde_json::from_str(r#"{"custom":"tokens"}"#).unwrap();
        assert_eq!(custom, UnitType::Custom("tokens".into()));
        assert_eq!(custom.to_string(), "tokens");
    }

    #[test]
    fn test_request_builder() {
        let req = AllocationRequest::new("gpu", "r1", 2)
            .with_priority(5)
            .with_max_wait(Duration::from_secs(1))
            .with_lease(Duration::from_secs(30));

        assert_eq!(req.pool, PoolId::from("gpu"));
        assert_eq!(req.priority, 5);
        assert_eq!(req.max_wait, Some(Duration::from_secs(1)));
        assert_eq!(req.lease, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(
            RejectReason::QuotaExceeded(QuotaLimit::Rate).to_string(),
            "quota exceeded (rate)"
        );
        assert_eq!(
            serde_json::to_string(&RejectReason::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }
}
