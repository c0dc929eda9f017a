//! Quartermaster Allocation Engine
//!
//! Admission control for finite, named capacity pools shared by many
//! requesters.
//!
//! # Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | No over-commit | Per-pool lock around `available` and the wait queue |
//! | Conservation | Every grant is released exactly once (release or lease expiry) |
//! | Fairness | Priority first, then FIFO; strict head-of-line draining |
//! | Quota isolation | Per-requester outstanding ceiling and sliding-window rate |
//! | Non-blocking events | Bounded drop-oldest buffer between engine and sink |
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         QUARTERMASTER ENGINE                        │
//! │                                                                     │
//! │   request / release / cancel                                        │
//! │                │                                                    │
//! │  ┌─────────────▼─────────────────────────────────────────────────┐  │
//! │  │                     ALLOCATION ENGINE                         │  │
//! │  │   quota check -> pool reserve -> grant | queue | reject       │  │
//! │  └──────┬───────────────────────┬──────────────────────┬─────────┘  │
//! │         │                       │                      │            │
//! │  ┌──────▼───────┐  ┌────────────▼───────────┐  ┌───────▼─────────┐  │
//! │  │    Quota     │  │     Pool Registry      │  │ Event Dispatcher│  │
//! │  │   Tracker    │  │  capacity + wait queue │  │  -> Event Sink  │  │
//! │  └──────────────┘  └────────────▲───────────┘  └─────────────────┘  │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┴────────────────────────────────┐  │
//! │  │   LIFECYCLE MANAGER: lease expiry | wait timeouts | advisor   │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod advisor;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod model;
pub mod pool;
pub mod queue;
pub mod quota;

use std::sync::Arc;

pub use advisor::{apply_advice, AdviceOutcome, SizingAdvisor, UtilizationAdvisor};
pub use config::{AdvisorConfig, ConfigError, EngineConfig, PoolConfig};
pub use engine::{Admission, AllocationEngine, QueuedHandle};
pub use error::{AllocError, AllocResult, PoolError, QuotaError};
pub use events::{
    AllocationEvent, ChannelSink, DispatchStats, EventDispatcher, EventKind, EventSink,
    ForwarderHandle, SinkError, TracingSink,
};
pub use lifecycle::{LifecycleHandle, LifecycleManager, SweepReport};
pub use model::{
    AllocationRequest, Grant, GrantHandle, GrantId, GrantStatus, PoolId, QuotaLimit,
    RejectReason, Rejection, RequestId, RequesterId, Resolution, UnitType,
};
pub use pool::{PoolRegistry, PoolStatus};
pub use quota::{QuotaPolicy, QuotaTracker, RateMode, RequesterLimits, RequesterStatus};

/// Engine plus the background services that keep it healthy
pub struct Quartermaster {
    /// Admission control
    pub engine: Arc<AllocationEngine>,
    /// Sweeper for leases and wait timeouts
    pub lifecycle: Arc<LifecycleManager>,
    config: EngineConfig,
}

impl Quartermaster {
    /// Validate `config`, build the engine and register configured pools
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let engine = Arc::new(AllocationEngine::with_sink(
            config.quota.clone(),
            sink,
            config.event_buffer_capacity,
        ));
        for pool in &config.pools {
            engine
                .register_pool(pool.id.clone(), pool.total, pool.unit.clone())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        let mut lifecycle = LifecycleManager::new(Arc::clone(&engine), config.sweep_interval());
        if let Some(advisor) = &config.advisor {
            lifecycle = lifecycle.with_advisor(Arc::new(advisor.advisor()), advisor.every_sweeps);
        }

        Ok(Self {
            engine,
            lifecycle: Arc::new(lifecycle),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the sweeper and event forwarder on the current runtime
    pub fn start(&self) -> Services {
        tracing::info!(pools = self.engine.pool_statuses().len(), "starting quartermaster services");
        Services {
            lifecycle: self.lifecycle.spawn(),
            forwarder: self.engine.events().spawn(),
        }
    }
}

/// Handles to running background tasks
pub struct Services {
    lifecycle: LifecycleHandle,
    forwarder: ForwarderHandle,
}

impl Services {
    /// Stop the sweeper, then flush and stop the forwarder
    pub async fn shutdown(self) {
        self.lifecycle.shutdown().await;
        self.forwarder.shutdown().await;
        tracing::info!("quartermaster services stopped");
    }
}
