//! Error types for Quartermaster

use crate::model::{PoolId, QuotaLimit, RequesterId};
use thiserror::Error;

/// Pool registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Pool not registered
    #[error("unknown pool: {0}")]
    UnknownPool(PoolId),

    /// Pool id already taken
    #[error("pool already registered: {0}")]
    PoolExists(PoolId),

    /// Not enough available capacity; nothing was mutated
    #[error("insufficient capacity in {pool}: requested {requested}, available {available}")]
    InsufficientCapacity {
        pool: PoolId,
        requested: u64,
        available: u64,
    },

    /// Shrinking would leave fewer units than are currently granted
    #[error("invalid resize of {pool}: new total {new_total} is below {in_use} units in use")]
    InvalidResize {
        pool: PoolId,
        new_total: u64,
        in_use: u64,
    },

    /// More capacity returned than was ever taken
    #[error("over-release on {pool}: returning {amount} with {available}/{total} available")]
    OverRelease {
        pool: PoolId,
        amount: u64,
        available: u64,
        total: u64,
    },

    /// Pool is quarantined after an accounting violation
    #[error("pool {0} is corrupted; mutation refused")]
    Corrupted(PoolId),
}

/// Quota tracker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// A per-requester limit would be violated
    #[error("{limit} quota exceeded for {requester}")]
    QuotaExceeded {
        requester: RequesterId,
        limit: QuotaLimit,
    },

    /// Outstanding total would go negative
    #[error("over-release for {requester}: returning {amount} with {outstanding} outstanding")]
    OverRelease {
        requester: RequesterId,
        amount: u64,
        outstanding: u64,
    },

    /// Requester is quarantined after an accounting violation
    #[error("requester {0} is suspended")]
    Suspended(RequesterId),
}

/// Allocation engine error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Grant or queued request no longer active
    #[error("already resolved")]
    AlreadyResolved,

    /// Pool registry failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Quota tracker failure
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

impl AllocError {
    /// True for accounting violations that quarantine a pool or requester
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Pool(PoolError::OverRelease { .. })
                | Self::Pool(PoolError::Corrupted(_))
                | Self::Quota(QuotaError::OverRelease { .. })
                | Self::Quota(QuotaError::Suspended(_))
        )
    }
}

/// Result type for allocation operations
pub type AllocResult<T> = Result<T, AllocError>;
