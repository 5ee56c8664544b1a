//! Typed error kinds the guest's lifecycle loop can match on (spec §7),
//! mirroring `tpc_host_agent::error::HostError`'s shape on the guest side.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("transient I/O: {0}")]
    TransientIo(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("bootstrap failed: {0}")]
    BootstrapFailure(String),

    #[error("host connection lost: {0}")]
    HostLost(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for GuestError {
    fn from(e: std::io::Error) -> Self {
        GuestError::TransientIo(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GuestError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => GuestError::HostLost(e.to_string()),
            WsError::Io(io) => GuestError::TransientIo(io.to_string()),
            WsError::Protocol(_) | WsError::Capacity(_) => GuestError::ProtocolViolation(e.to_string()),
            other => GuestError::TransientIo(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for GuestError {
    fn from(e: serde_json::Error) -> Self {
        GuestError::ProtocolViolation(e.to_string())
    }
}

impl From<reqwest::Error> for GuestError {
    fn from(e: reqwest::Error) -> Self {
        GuestError::TransientIo(e.to_string())
    }
}

impl From<kube::Error> for GuestError {
    fn from(e: kube::Error) -> Self {
        GuestError::TransientIo(e.to_string())
    }
}

impl GuestError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GuestError::Fatal(_))
    }
}
