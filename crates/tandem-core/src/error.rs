//! Error type shared by the session engine.

use crate::registry::ConnectionId;
use tandem_protocol::{DocumentId, ProtocolError};
use thiserror::Error;

/// Errors raised by the stores, the broadcaster and the hub.
///
/// None of these is fatal to the process: they concern one connection or one
/// document only.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Document does not exist.
    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    /// Connection is unknown to the session registry.
    #[error("Connection not registered: {0}")]
    NotRegistered(ConnectionId),

    /// Connection id is already in use.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// An event could not be queued for a subscriber.
    #[error("Delivery to {connection} failed: {reason}")]
    DeliveryFailure {
        connection: ConnectionId,
        reason: &'static str,
    },

    /// Inbound event is missing required fields.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Connectivity loss reported by the transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend failure of a document store.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Stable numeric code used in `error` events.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            SyncError::MalformedMessage(_) => 1002,
            SyncError::NotFound(_) => 1004,
            SyncError::NotRegistered(_) => 1008,
            SyncError::AlreadyRegistered(_) => 1009,
            SyncError::DeliveryFailure { .. } => 1010,
            SyncError::Transport(_) => 1011,
            SyncError::Storage(_) => 1500,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::MalformedMessage(err.to_string())
    }
}
