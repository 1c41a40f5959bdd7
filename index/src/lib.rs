mod types;
mod link;
mod events;
mod index;

pub use types::{
    ClusterView, FileRecord, FileSummary, LoadTarget, NodeInstruction, NodeSummary,
    OperationState, Placement, Port, ReplicaSummary, SendInstruction, StorageNode,
};
pub use link::{LinkError, NodeLink};
pub use events::{ClusterEvent, EventSink, RecordingEventSink, TracingEventSink};
pub use index::Index;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("Port already in use: {0}")]
    PortInUse(Port),

    #[error("Insufficient nodes: {current} < {required}")]
    InsufficientNodes { current: usize, required: usize },

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("No viable node left for {0}")]
    NoViableNode(String),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),
}
