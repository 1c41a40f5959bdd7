use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::link::NodeLink;

/// Storage nodes are identified by the port they listen on.
pub type Port = u16;

/// Files held by one node, by name, with their sizes.
pub type Placement = BTreeMap<String, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    StoreInProgress,
    StoreAckReceived,
    Idle,
    RemoveInProgress,
    RemoveAckReceived,
}

impl OperationState {
    pub fn is_idle(self) -> bool {
        matches!(self, OperationState::Idle)
    }

    /// Forward transitions only; a state is never revisited within one operation.
    pub fn can_advance_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (StoreInProgress, StoreAckReceived)
                | (StoreAckReceived, Idle)
                | (Idle, RemoveInProgress)
                | (RemoveInProgress, RemoveAckReceived)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::StoreInProgress => "store in progress",
            OperationState::StoreAckReceived => "store acknowledged",
            OperationState::Idle => "idle",
            OperationState::RemoveInProgress => "remove in progress",
            OperationState::RemoveAckReceived => "remove acknowledged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    pub state: OperationState,
}

impl FileRecord {
    pub fn new(filename: impl Into<String>, size: u64, state: OperationState) -> Self {
        Self {
            filename: filename.into(),
            size,
            state,
        }
    }
}

pub struct StorageNode {
    pub port: Port,
    pub connection: Uuid,
    pub joined_at: DateTime<Utc>,
    pub(crate) link: Arc<dyn NodeLink>,
    pub(crate) files: BTreeMap<String, FileRecord>,
}

impl fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageNode")
            .field("port", &self.port)
            .field("connection", &self.connection)
            .field("joined_at", &self.joined_at)
            .field("files", &self.files)
            .finish()
    }
}

impl StorageNode {
    pub fn new(port: Port, connection: Uuid, link: Arc<dyn NodeLink>) -> Self {
        Self {
            port,
            connection,
            joined_at: Utc::now(),
            link,
            files: BTreeMap::new(),
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn link(&self) -> Arc<dyn NodeLink> {
        self.link.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTarget {
    pub port: Port,
    pub size: u64,
}

/// A file a node must push to the listed destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInstruction {
    pub filename: String,
    pub size: u64,
    pub destinations: Vec<Port>,
}

/// Everything one node has to do in a rebalance pass. Sends are carried out
/// before removals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInstruction {
    pub sends: Vec<SendInstruction>,
    pub removals: Vec<String>,
}

impl NodeInstruction {
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.removals.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub replication_factor: usize,
    pub nodes: Vec<NodeSummary>,
    pub files: Vec<FileSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub port: Port,
    pub file_count: usize,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub filename: String,
    pub size: u64,
    pub replicas: Vec<ReplicaSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSummary {
    pub port: Port,
    pub state: OperationState,
}
