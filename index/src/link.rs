use std::time::Duration;

use async_trait::async_trait;

use crate::types::{NodeInstruction, Placement};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("node connection closed")]
    Disconnected,
}

/// The controller's channel to one registered storage node.
#[async_trait]
pub trait NodeLink: Send + Sync {
    /// Asks the node which files it durably holds.
    async fn list_files(&self, timeout: Duration) -> Result<Placement, LinkError>;

    /// Sends one combined rebalance instruction and waits for its completion.
    async fn rebalance(&self, instruction: &NodeInstruction, timeout: Duration) -> Result<(), LinkError>;

    /// Tells the node to delete a file. The acknowledgment arrives separately.
    fn remove_file(&self, filename: &str) -> Result<(), LinkError>;
}
