use thiserror::Error;

use super::codes::MessageCode;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected message: expected {expected:?}, received {actual}")]
    UnexpectedMessage { expected: MessageCode, actual: u8 },

    #[error("Message type is not registered: {0}")]
    UnregisteredMessage(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timed out acquiring a pooled connection after {0}ms")]
    PoolTimeout(u64),

    #[error("Connection pool is disposed")]
    PoolDisposed,

    #[error("Node offline: {0}")]
    NodeOffline(String),

    #[error("No node reachable after {attempts} attempt(s): {last_error}")]
    NodeUnreachable { attempts: usize, last_error: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StrataError {
    /// Returns `true` for failures to reach or talk to a node.
    ///
    /// These are retried against another node by the cluster. Everything else
    /// (server error replies, codec failures, bad arguments) is returned to
    /// the caller on the first attempt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StrataError::Io(_)
                | StrataError::Connection(_)
                | StrataError::Timeout(_)
                | StrataError::Tls(_)
                | StrataError::FrameTooLarge { .. }
                | StrataError::MalformedFrame(_)
                | StrataError::UnexpectedMessage { .. }
                | StrataError::PoolTimeout(_)
                | StrataError::PoolDisposed
                | StrataError::NodeOffline(_)
        )
    }

    /// Returns `true` when the retry budget was spent without reaching a node.
    pub fn is_node_unreachable(&self) -> bool {
        matches!(self, StrataError::NodeUnreachable { .. })
    }
}

impl From<rustls::Error> for StrataError {
    fn from(err: rustls::Error) -> Self {
        StrataError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
