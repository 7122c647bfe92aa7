//! Session registry for Tandem.
//!
//! The registry knows every live connection, the document each one has joined
//! (at most one at a time) and, per document, the set of connections that
//! should receive its events. Each connection owns a bounded outbound queue;
//! the registry holds the sending half.

use crate::error::SyncError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_protocol::{DocumentId, ServerEvent, UserId};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Counter keeping ids unique even within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The document a connection has joined, and as which user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub document_id: DocumentId,
    pub user_id: UserId,
}

impl Binding {
    #[must_use]
    pub fn new(document_id: impl Into<DocumentId>, user_id: impl Into<UserId>) -> Self {
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Receiving half of a connection's outbound queue.
pub type Outbound = mpsc::Receiver<Arc<ServerEvent>>;

struct ConnectionEntry {
    sender: mpsc::Sender<Arc<ServerEvent>>,
    binding: Option<Binding>,
}

/// Registry of live connections and per-document subscriber sets.
///
/// Operations that touch both maps always lock the connection entry first and
/// the document entry second.
pub struct SessionRegistry {
    /// Connection id -> outbound queue and current binding.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Document id -> subscribed connections and the user each joined as.
    documents: DashMap<DocumentId, HashMap<ConnectionId, UserId>>,
    outbound_capacity: usize,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Create a registry whose outbound queues hold `outbound_capacity` events.
    #[must_use]
    pub fn with_capacity(outbound_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            documents: DashMap::new(),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Register a connection with no document binding.
    ///
    /// Returns the receiving end of the connection's outbound queue.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` if the id is live.
    pub fn register(&self, connection_id: ConnectionId) -> Result<Outbound, SyncError> {
        match self.connections.entry(connection_id) {
            Entry::Occupied(occupied) => Err(SyncError::AlreadyRegistered(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = mpsc::channel(self.outbound_capacity);
                debug!(connection = %vacant.key(), "Registered connection");
                vacant.insert(ConnectionEntry {
                    sender,
                    binding: None,
                });
                Ok(receiver)
            }
        }
    }

    /// Bind a connection to a document as `user_id`.
    ///
    /// Any previous binding is torn down first and returned.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` for unknown connections.
    pub fn bind_to_document(
        &self,
        connection_id: &ConnectionId,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<Binding>, SyncError> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SyncError::NotRegistered(connection_id.clone()))?;

        let previous = entry.binding.take();
        if let Some(prev) = &previous {
            self.remove_subscriber(&prev.document_id, connection_id);
        }

        self.documents
            .entry(document_id.to_string())
            .or_default()
            .insert(connection_id.clone(), user_id.to_string());
        entry.binding = Some(Binding::new(document_id, user_id));

        debug!(
            connection = %connection_id,
            document = %document_id,
            user = %user_id,
            superseded = previous.is_some(),
            "Bound connection"
        );

        Ok(previous)
    }

    /// Clear a connection's binding, whatever document it is for.
    pub fn unbind(&self, connection_id: &ConnectionId) -> Option<Binding> {
        let mut entry = self.connections.get_mut(connection_id)?;
        let binding = entry.binding.take()?;
        self.remove_subscriber(&binding.document_id, connection_id);

        debug!(connection = %connection_id, document = %binding.document_id, "Unbound connection");
        Some(binding)
    }

    /// Clear a connection's binding only if it is for `document_id`.
    pub fn unbind_from(&self, connection_id: &ConnectionId, document_id: &str) -> Option<Binding> {
        let mut entry = self.connections.get_mut(connection_id)?;
        if entry.binding.as_ref()?.document_id != document_id {
            trace!(connection = %connection_id, document = %document_id, "Unbind for other document ignored");
            return None;
        }

        let binding = entry.binding.take()?;
        self.remove_subscriber(&binding.document_id, connection_id);

        debug!(connection = %connection_id, document = %document_id, "Unbound connection");
        Some(binding)
    }

    /// Remove a connection entirely, closing its outbound queue.
    ///
    /// Returns the binding that was cleared, if any.
    pub fn deregister(&self, connection_id: &ConnectionId) -> Option<Binding> {
        let (_, entry) = self.connections.remove(connection_id)?;
        if let Some(binding) = &entry.binding {
            self.remove_subscriber(&binding.document_id, connection_id);
        }

        debug!(connection = %connection_id, "Deregistered connection");
        entry.binding
    }

    /// Connections subscribed to a document, sorted.
    #[must_use]
    pub fn subscribers_of(&self, document_id: &str) -> Vec<ConnectionId> {
        let mut subscribers: Vec<ConnectionId> = self
            .documents
            .get(document_id)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    /// Current binding of a connection.
    #[must_use]
    pub fn binding(&self, connection_id: &ConnectionId) -> Option<Binding> {
        self.connections
            .get(connection_id)
            .and_then(|e| e.binding.clone())
    }

    /// Whether any connection is bound to `document_id` as `user_id`.
    #[must_use]
    pub fn is_user_bound(&self, document_id: &str, user_id: &str) -> bool {
        self.documents
            .get(document_id)
            .is_some_and(|s| s.values().any(|u| u == user_id))
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Queue an event for a connection without waiting.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` for unknown connections and `DeliveryFailure`
    /// when the queue is full or its receiver is gone.
    pub fn send_to(
        &self,
        connection_id: &ConnectionId,
        event: Arc<ServerEvent>,
    ) -> Result<(), SyncError> {
        let entry = self
            .connections
            .get(connection_id)
            .ok_or_else(|| SyncError::NotRegistered(connection_id.clone()))?;

        entry.sender.try_send(event).map_err(|e| SyncError::DeliveryFailure {
            connection: connection_id.clone(),
            reason: match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full",
                mpsc::error::TrySendError::Closed(_) => "connection closed",
            },
        })
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            document_count: self.documents.len(),
            total_subscriptions: self.documents.iter().map(|s| s.len()).sum(),
        }
    }

    fn remove_subscriber(&self, document_id: &str, connection_id: &ConnectionId) {
        if let Some(mut subscribers) = self.documents.get_mut(document_id) {
            subscribers.remove(connection_id);
        }
        if self
            .documents
            .remove_if(document_id, |_, s| s.is_empty())
            .is_some()
        {
            trace!(document = %document_id, "Dropped empty subscriber set");
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of documents with at least one subscriber.
    pub document_count: usize,
    /// Total number of bound connections.
    pub total_subscriptions: usize,
}
