//! Sizing advice
//!
//! An optional hook that looks at pool utilization and proposes a new total.
//! Suggestions are applied through `resize_pool`, so they obey the same
//! rules as an operator resize.

use crate::engine::AllocationEngine;
use crate::error::AllocResult;
use crate::model::PoolId;
use crate::pool::PoolStatus;

/// Proposes capacity changes for a pool
pub trait SizingAdvisor: Send + Sync {
    /// Suggested new total, or `None` to leave the pool alone
    fn advise(&self, pool: &PoolStatus) -> Option<u64>;
}

impl<F> SizingAdvisor for F
where
    F: Fn(&PoolStatus) -> Option<u64> + Send + Sync,
{
    fn advise(&self, pool: &PoolStatus) -> Option<u64> {
        self(pool)
    }
}

/// Grows a pool by `step` when utilization crosses `threshold` and
/// requests are waiting, up to `ceiling`
#[derive(Debug, Clone, Copy)]
pub struct UtilizationAdvisor {
    pub threshold: f64,
    pub step: u64,
    pub ceiling: u64,
}

impl SizingAdvisor for UtilizationAdvisor {
    fn advise(&self, pool: &PoolStatus) -> Option<u64> {
        if pool.corrupted || pool.queued == 0 || pool.utilization() < self.threshold {
            return None;
        }
        let next = pool.total.saturating_add(self.step).min(self.ceiling);
        (next > pool.total).then_some(next)
    }
}

/// Result of applying one suggestion
#[derive(Debug)]
pub struct AdviceOutcome {
    pub pool: PoolId,
    pub suggested: u64,
    pub result: AllocResult<()>,
}

/// Ask the advisor about every pool and apply what it suggests
pub fn apply_advice(engine: &AllocationEngine, advisor: &dyn SizingAdvisor) -> Vec<AdviceOutcome> {
    engine
        .pool_statuses()
        .into_iter()
        .filter_map(|status| {
            let suggested = advisor.advise(&status)?;
            if suggested == status.total {
                return None;
            }
            let result = engine.resize_pool(&status.id, suggested);
            if let Err(e) = &result {
                tracing::warn!(pool = %status.id, suggested, error = %e, "sizing advice rejected");
            }
            Some(AdviceOutcome {
                pool: status.id,
                suggested,
                result,
            })
        })
        .collect()
}
