//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Port busy: {0}")]
    PortBusy(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether the target could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_) | TransportError::ConnectionClosed
        )
    }
}
