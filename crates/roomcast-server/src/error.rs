//! Server error types.

use roomcast_proto::ProtocolError;
use thiserror::Error;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error (bad option value, unknown config key, invalid
    /// server name). Fatal at startup only; fix the configuration and
    /// restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (bind failure, unrecoverable socket I/O). Fatal;
    /// triggers graceful shutdown.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol error surfaced outside the per-message drop path, for
    /// example while assembling an outbound broadcast.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
