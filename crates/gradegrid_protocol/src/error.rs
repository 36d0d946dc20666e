//! Error taxonomy shared across the cluster.

use thiserror::Error;

/// Closed error set for all fabric, protocol, and executor operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket connect/send/recv failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed frame, or a variant that is invalid in the context it
    /// arrived in (wrong channel, unexpected reply).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Filesystem read/write failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Child process could not be spawned, or died abnormally.
    #[error("subprocess failure: {0}")]
    Subprocess(String),

    /// A socket was closed underneath a pending operation.
    #[error("shut down during {0}")]
    Shutdown(&'static str),
}

impl ProtocolError {
    /// Invalid-context error for a variant on a channel that cannot carry it.
    pub fn invalid_context(variant: &str, channel: &str) -> Self {
        ProtocolError::Protocol(format!(
            "invalid context: {variant} cannot arrive on the {channel} channel"
        ))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
