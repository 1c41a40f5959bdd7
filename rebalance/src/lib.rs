mod distribution;
mod planner;
mod rebalancer;

pub use distribution::{BalanceReport, Distribution};
pub use planner::{Planner, RebalancePlan};
pub use rebalancer::Rebalancer;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use index::{LinkError, Port};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub replication_factor: usize,
    pub timeout_ms: u64,
    pub rebalance_period_ms: u64,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rebalance_period(&self) -> Duration {
        Duration::from_millis(self.rebalance_period_ms)
    }
}

/// What a single rebalance pass ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass held the lock; this request was folded into it.
    AlreadyRunning,
    Skipped { reason: String },
    Balanced,
    Rebalanced { sends: usize, removals: usize },
}

pub type Result<T> = std::result::Result<T, RebalanceError>;

#[derive(Debug, thiserror::Error)]
pub enum RebalanceError {
    #[error("Rebalance failed: {0}")]
    RebalanceFailed(String),

    #[error("Node {port} failed: {source}")]
    Link {
        port: Port,
        #[source]
        source: LinkError,
    },
}
