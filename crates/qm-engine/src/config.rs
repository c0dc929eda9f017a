//! Engine Configuration

use crate::advisor::UtilizationAdvisor;
use crate::model::{PoolId, UnitType};
use crate::quota::QuotaPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-requester limits
    pub quota: QuotaPolicy,
    /// Lifecycle sweep period
    pub sweep_interval_ms: u64,
    /// Events kept for the sink before the oldest are dropped
    pub event_buffer_capacity: usize,
    /// Pools registered at startup
    pub pools: Vec<PoolConfig>,
    /// Optional utilization-based sizing
    pub advisor: Option<AdvisorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quota: QuotaPolicy::default(),
            sweep_interval_ms: 50,
            event_buffer_capacity: 1024,
            pools: Vec::new(),
            advisor: None,
        }
    }
}

/// A pool registered at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: PoolId,
    pub total: u64,
    #[serde(default)]
    pub unit: UnitType,
}

/// Utilization advisor settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// Utilization (0.0 - 1.0) at which a pool with waiters is grown
    pub threshold: f64,
    /// Units added per adjustment
    pub step: u64,
    /// Largest total the advisor will suggest
    pub ceiling: u64,
    /// Consult the advisor every N sweeps
    pub every_sweeps: u64,
}

impl AdvisorConfig {
    pub fn advisor(&self) -> UtilizationAdvisor {
        UtilizationAdvisor {
            threshold: self.threshold,
            step: self.step,
            ceiling: self.ceiling,
        }
    }
}

impl EngineConfig {
    /// Load and validate from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        if self.event_buffer_capacity == 0 {
            return Err(ConfigError::Invalid("event_buffer_capacity must be positive".into()));
        }
        if self.quota.rate_window_ms == 0 {
            return Err(ConfigError::Invalid("quota.rate_window_ms must be positive".into()));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(&pool.id) {
                return Err(ConfigError::Invalid(format!("duplicate pool id: {}", pool.id)));
            }
        }

        if let Some(advisor) = &self.advisor {
            if advisor.every_sweeps == 0 {
                return Err(ConfigError::Invalid("advisor.every_sweeps must be positive".into()));
            }
            if !(0.0..=1.0).contains(&advisor.threshold) {
                return Err(ConfigError::Invalid("advisor.threshold must be within 0.0 - 1.0".into()));
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
