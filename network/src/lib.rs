mod protocol;
mod connection;

pub use protocol::{FileEntry, Message, RebalanceSend};
pub use connection::{Connection, ConnectionHandle, ConnectionId, MessageReader, MAX_LINE_LENGTH};

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(ConnectionId),

    #[error("Timeout: {0}")]
    Timeout(String),
}
