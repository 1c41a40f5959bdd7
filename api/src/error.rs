use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use index::{IndexError, Port};
use network::{Message, NetworkError};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Not enough storage nodes: {current} < {required}")]
    InsufficientNodes { current: usize, required: usize },

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("No replica left to load {0} from")]
    NoViableNode(String),

    #[error("Storage node port already in use: {0}")]
    PortInUse(Port),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    /// The protocol line a client receives for this error, if any. Timeouts
    /// are only logged; the client is left waiting.
    pub fn reply(&self) -> Option<Message> {
        match self {
            ApiError::InsufficientNodes { .. } => Some(Message::ErrorNotEnoughDstores),
            ApiError::FileAlreadyExists(_) => Some(Message::ErrorFileAlreadyExists),
            ApiError::FileNotFound(_) => Some(Message::ErrorFileDoesNotExist { filename: None }),
            ApiError::NoViableNode(_) => Some(Message::ErrorLoad),
            ApiError::PortInUse(_) => Some(Message::ErrorDstorePortInUse),
            ApiError::OperationTimedOut(_)
            | ApiError::InvalidMessage(_)
            | ApiError::ConnectionLost(_)
            | ApiError::NotFound(_)
            | ApiError::InternalError(_) => None,
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::PortInUse(port) => ApiError::PortInUse(port),
            IndexError::InsufficientNodes { current, required } => {
                ApiError::InsufficientNodes { current, required }
            }
            IndexError::FileAlreadyExists(f) => ApiError::FileAlreadyExists(f),
            IndexError::FileNotFound(f) => ApiError::FileNotFound(f),
            IndexError::NoViableNode(f) => ApiError::NoViableNode(f),
            IndexError::OperationTimedOut(f) => ApiError::OperationTimedOut(f),
        }
    }
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::InvalidMessage(reason) => ApiError::InvalidMessage(reason),
            NetworkError::ConnectionLost(id) => ApiError::ConnectionLost(id.to_string()),
            NetworkError::Io(e) => ApiError::ConnectionLost(e.to_string()),
            NetworkError::Timeout(reason) => ApiError::OperationTimedOut(reason),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::InsufficientNodes { .. } => (StatusCode::SERVICE_UNAVAILABLE, "InsufficientNodes"),
            ApiError::FileAlreadyExists(_) => (StatusCode::CONFLICT, "FileAlreadyExists"),
            ApiError::FileNotFound(_) | ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::NoViableNode(_) => (StatusCode::SERVICE_UNAVAILABLE, "NoViableNode"),
            ApiError::PortInUse(_) => (StatusCode::CONFLICT, "PortInUse"),
            ApiError::OperationTimedOut(_) => (StatusCode::GATEWAY_TIMEOUT, "OperationTimedOut"),
            ApiError::InvalidMessage(_) => (StatusCode::BAD_REQUEST, "InvalidMessage"),
            ApiError::ConnectionLost(_) | ApiError::InternalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        };

        let body = serde_json::json!({
            "code": code,
            "message": self.to_string(),
            "request_id": uuid::Uuid::new_v4(),
        });

        (status, Json(body)).into_response()
    }
}
