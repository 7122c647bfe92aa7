//! Event types for the Tandem protocol.
//!
//! Every message on the wire is an event: a name plus a payload. Clients send
//! [`ClientEvent`]s, the server answers with [`ServerEvent`]s. Both are
//! adjacently tagged, so the JSON form reads
//! `{"event": "join", "data": {"documentId": "doc1", "userId": "alice"}}`.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// A document identifier.
pub type DocumentId = String;

/// A user identifier.
pub type UserId = String;

/// Kind of edit carried by a [`ChangeEvent`].
///
/// The server treats every kind as a whole-content replacement and relays the
/// kind verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    #[default]
    Update,
    Create,
    Delete,
}

/// A full-content edit of a document, originated by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// User that made the edit.
    pub user_id: UserId,
    /// Edited document.
    #[serde(alias = "fileId")]
    pub document_id: DocumentId,
    /// New content of the whole document.
    pub content: String,
    /// Sender-side time of the edit in Unix milliseconds.
    ///
    /// Also accepted as an RFC 3339 string, which is how browsers serialize
    /// a `Date`.
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub timestamp: u64,
    #[serde(default)]
    pub change_type: ChangeType,
}

impl ChangeEvent {
    /// Create an update event stamped with the current time.
    #[must_use]
    pub fn update(
        user_id: impl Into<UserId>,
        document_id: impl Into<DocumentId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: document_id.into(),
            content: content.into(),
            timestamp: now_millis(),
            change_type: ChangeType::Update,
        }
    }

    /// Set the change type.
    #[must_use]
    pub fn with_change_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = change_type;
        self
    }
}

/// Join/leave payload: which user enters or exits which document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    #[serde(alias = "fileId")]
    pub document_id: DocumentId,
    pub user_id: UserId,
}

impl Membership {
    #[must_use]
    pub fn new(document_id: impl Into<DocumentId>, user_id: impl Into<UserId>) -> Self {
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Start viewing a document.
    #[serde(alias = "joinFile")]
    Join(Membership),

    /// Stop viewing a document.
    #[serde(alias = "leaveFile")]
    Leave(Membership),

    /// Replace a document's content.
    #[serde(alias = "fileChange", alias = "textChange")]
    Change(ChangeEvent),

    /// Application-level keepalive.
    Ping,
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::Leave(_) => "leave",
            ClientEvent::Change(_) => "change",
            ClientEvent::Ping => "ping",
        }
    }

    /// Check that all identifiers are present.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] when a document or user id is empty.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let (document_id, user_id) = match self {
            ClientEvent::Join(m) | ClientEvent::Leave(m) => (&m.document_id, &m.user_id),
            ClientEvent::Change(c) => (&c.document_id, &c.user_id),
            ClientEvent::Ping => return Ok(()),
        };

        if document_id.trim().is_empty() {
            return Err(ProtocolError::Invalid(format!(
                "{}: documentId is required",
                self.name()
            )));
        }
        if user_id.trim().is_empty() {
            return Err(ProtocolError::Invalid(format!(
                "{}: userId is required",
                self.name()
            )));
        }
        Ok(())
    }
}

/// Greeting sent once a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Server-assigned connection identifier.
    pub connection_id: String,
    /// Protocol major version.
    pub version: u8,
    /// Recommended heartbeat interval in milliseconds.
    pub heartbeat: u32,
}

/// A user entered or left a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
    pub document_id: DocumentId,
    /// Users present on the document after the transition, ascending.
    #[serde(default)]
    pub active_users: Vec<UserId>,
}

/// Error reported to the client that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: u16,
    pub message: String,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Connected(Welcome),
    /// An edit made by another participant.
    Change(ChangeEvent),
    UserJoined(PresenceNotice),
    UserLeft(PresenceNotice),
    Error(ErrorNotice),
    Pong,
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::Change(_) => "change",
            ServerEvent::UserJoined(_) => "userJoined",
            ServerEvent::UserLeft(_) => "userLeft",
            ServerEvent::Error(_) => "error",
            ServerEvent::Pong => "pong",
        }
    }

    /// Create a `connected` greeting.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerEvent::Connected(Welcome {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        })
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            code,
            message: message.into(),
        })
    }

    /// Document the event concerns, if any.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Change(c) => Some(&c.document_id),
            ServerEvent::UserJoined(n) | ServerEvent::UserLeft(n) => Some(&n.document_id),
            _ => None,
        }
    }
}

mod timestamp {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;

    struct MillisVisitor;

    impl<'de> Visitor<'de> for MillisVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("Unix milliseconds or an RFC 3339 timestamp")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("timestamp {} is before 1970", v)))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<u64, E> {
            if v.is_finite() && v >= 0.0 {
                Ok(v as u64)
            } else {
                Err(E::custom(format!("invalid timestamp {}", v)))
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            let parsed = chrono::DateTime::parse_from_rfc3339(v).map_err(E::custom)?;
            u64::try_from(parsed.timestamp_millis())
                .map_err(|_| E::custom(format!("timestamp {} is before 1970", v)))
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(MillisVisitor)
    }
}

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
