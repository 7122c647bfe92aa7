//! Transport errors.

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Gave up connecting.
    #[error("Connect failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// Server speaks another major protocol version.
    #[error("Incompatible protocol version {0}")]
    Incompatible(u8),

    /// Server sent something other than what the handshake expects.
    #[error("Unexpected event: {0}")]
    UnexpectedEvent(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tandem_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the connection is gone and a reconnect is the only way on.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed
                | TransportError::Timeout
                | TransportError::ReceiveFailed(_)
                | TransportError::SendFailed(_)
                | TransportError::Io(_)
        )
    }
}
