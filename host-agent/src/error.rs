//! Typed error kinds the supervisor can match on, rather than stringly-typed
//! messages surfacing from every library call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("transient I/O: {0}")]
    TransientIo(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("bootstrap failed: {0}")]
    BootstrapFailure(String),

    #[error("guest connection lost: {0}")]
    GuestLost(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for HostError {
    fn from(e: std::io::Error) -> Self {
        HostError::TransientIo(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HostError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                HostError::GuestLost(e.to_string())
            }
            WsError::Io(io) => HostError::TransientIo(io.to_string()),
            WsError::Protocol(_) | WsError::Capacity(_) => HostError::ProtocolViolation(e.to_string()),
            other => HostError::TransientIo(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::ProtocolViolation(e.to_string())
    }
}

impl From<reqwest::Error> for HostError {
    fn from(e: reqwest::Error) -> Self {
        HostError::TransientIo(e.to_string())
    }
}

impl HostError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::Fatal(_))
    }
}
