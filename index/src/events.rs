use std::sync::Mutex;

use crate::types::Port;

/// Domain events raised by the index, the rebalancer and the request sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeJoined { port: Port },
    NodeRejected { port: Port },
    NodeLeft { port: Port },
    StoreStarted { filename: String, nodes: Vec<Port> },
    StoreCompleted { filename: String },
    StoreRolledBack { filename: String },
    RemoveStarted { filename: String, nodes: Vec<Port> },
    RemoveCompleted { filename: String },
    RemoveTimedOut { filename: String },
    AckIgnored { port: Port, filename: String },
    LoadExhausted { filename: String },
    RebalanceSkipped { reason: String },
    RebalanceNotNeeded,
    RebalanceCompleted { sends: usize, removals: usize },
    RebalanceFailed { reason: String },
    InvalidMessage { peer: String, reason: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClusterEvent);
}

/// Default sink: every event becomes a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::NodeJoined { port } => tracing::info!(port, "Storage node joined"),
            ClusterEvent::NodeRejected { port } => {
                tracing::warn!(port, "Storage node rejected: port already in use")
            }
            ClusterEvent::NodeLeft { port } => tracing::warn!(port, "Storage node left"),
            ClusterEvent::StoreStarted { filename, nodes } => {
                tracing::info!(%filename, ?nodes, "Store started")
            }
            ClusterEvent::StoreCompleted { filename } => tracing::info!(%filename, "Store completed"),
            ClusterEvent::StoreRolledBack { filename } => {
                tracing::warn!(%filename, "Store timed out, rolled back")
            }
            ClusterEvent::RemoveStarted { filename, nodes } => {
                tracing::info!(%filename, ?nodes, "Remove started")
            }
            ClusterEvent::RemoveCompleted { filename } => tracing::info!(%filename, "Remove completed"),
            ClusterEvent::RemoveTimedOut { filename } => {
                tracing::warn!(%filename, "Remove timed out, records dropped")
            }
            ClusterEvent::AckIgnored { port, filename } => {
                tracing::debug!(port, %filename, "Ignoring late or duplicate acknowledgment")
            }
            ClusterEvent::LoadExhausted { filename } => {
                tracing::warn!(%filename, "Every replica has been tried")
            }
            ClusterEvent::RebalanceSkipped { reason } => tracing::debug!(%reason, "Rebalance skipped"),
            ClusterEvent::RebalanceNotNeeded => tracing::debug!("No rebalance needed"),
            ClusterEvent::RebalanceCompleted { sends, removals } => {
                tracing::info!(sends, removals, "Rebalance completed")
            }
            ClusterEvent::RebalanceFailed { reason } => tracing::error!(%reason, "Rebalance failed"),
            ClusterEvent::InvalidMessage { peer, reason } => {
                tracing::warn!(%peer, %reason, "Rejected invalid message")
            }
        }
    }
}

/// Keeps every event in memory; used by tests to observe what happened.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ClusterEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, event: &ClusterEvent) -> bool {
        self.events().iter().any(|e| e == event)
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: ClusterEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
