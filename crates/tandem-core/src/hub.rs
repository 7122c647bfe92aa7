//! Connection lifecycle handling.
//!
//! The hub ties the document store, the presence tracker and the session
//! registry together and reacts to connection events: connect, join, leave,
//! change and disconnect.

use crate::broadcaster::{Applied, ChangeBroadcaster};
use crate::error::SyncError;
use crate::presence::PresenceTracker;
use crate::registry::{Binding, ConnectionId, Outbound, SessionRegistry, DEFAULT_OUTBOUND_CAPACITY};
use crate::store::{Document, DocumentStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_protocol::{now_millis, ChangeEvent, ChangeType, ClientEvent, PresenceNotice, ServerEvent};
use tracing::{debug, info, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events each connection may have queued before it counts as unresponsive.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// The session engine.
///
/// One hub is shared by all connection workers.
pub struct SessionHub {
    store: Arc<dyn DocumentStore>,
    presence: PresenceTracker,
    registry: Arc<SessionRegistry>,
    broadcaster: ChangeBroadcaster,
    delivery_failures: AtomicU64,
    evictions: AtomicU64,
}

impl SessionHub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_config(store, HubConfig::default())
    }

    #[must_use]
    pub fn with_config(store: Arc<dyn DocumentStore>, config: HubConfig) -> Self {
        info!("Creating session hub with config: {:?}", config);
        let registry = Arc::new(SessionRegistry::with_capacity(config.outbound_capacity));
        Self {
            broadcaster: ChangeBroadcaster::new(Arc::clone(&store), Arc::clone(&registry)),
            store,
            presence: PresenceTracker::new(),
            registry,
            delivery_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register a new connection. It is not associated with any document yet.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` if the id is live.
    pub fn connect(&self, connection_id: &ConnectionId) -> Result<Outbound, SyncError> {
        self.registry.register(connection_id.clone())
    }

    /// Dispatch an inbound event from a connection.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` for events missing identifiers, and whatever
    /// the dispatched operation returns.
    pub async fn handle(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<(), SyncError> {
        event.validate()?;

        match event {
            ClientEvent::Join(m) => self.join(connection_id, &m.document_id, &m.user_id).await,
            ClientEvent::Leave(m) => {
                self.leave(connection_id, &m.document_id, &m.user_id);
                Ok(())
            }
            ClientEvent::Change(change) => self.change(connection_id, change).await.map(|_| ()),
            ClientEvent::Ping => self
                .registry
                .send_to(connection_id, Arc::new(ServerEvent::Pong)),
        }
    }

    /// Join a document as `user_id`.
    ///
    /// A previous binding of the connection is left first. Every subscriber
    /// of the document, the joiner included, is told about the join.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown documents and `NotRegistered` for
    /// unknown connections.
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        document_id: &str,
        user_id: &str,
    ) -> Result<(), SyncError> {
        self.store.get(document_id).await?;

        let mut failed = Vec::new();
        if let Some(previous) = self
            .registry
            .bind_to_document(connection_id, document_id, user_id)?
        {
            if previous != Binding::new(document_id, user_id) {
                failed.extend(self.depart(&previous));
            }
        }

        self.presence.join(document_id, user_id);
        let notice = ServerEvent::UserJoined(self.notice(document_id, user_id));
        failed.extend(self.broadcaster.broadcast(document_id, notice, None).failed);

        info!(connection = %connection_id, document = %document_id, user = %user_id, "User joined");
        self.evict(failed);
        Ok(())
    }

    /// Leave a document.
    ///
    /// A no-op unless the connection is currently bound to `document_id`.
    /// Returns whether a binding was cleared.
    pub fn leave(&self, connection_id: &ConnectionId, document_id: &str, user_id: &str) -> bool {
        let Some(binding) = self.registry.unbind_from(connection_id, document_id) else {
            debug!(connection = %connection_id, document = %document_id, "Leave without matching join");
            return false;
        };

        if binding.user_id != user_id {
            debug!(
                connection = %connection_id,
                bound = %binding.user_id,
                claimed = %user_id,
                "Leave names another user, using bound user"
            );
        }

        let failed = self.depart(&binding);
        self.evict(failed);
        true
    }

    /// Apply an edit from a connection and relay it to the other subscribers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub async fn change(
        &self,
        connection_id: &ConnectionId,
        change: ChangeEvent,
    ) -> Result<Applied, SyncError> {
        let (document_id, user_id) = (change.document_id.clone(), change.user_id.clone());

        let applied = self
            .broadcaster
            .apply_and_broadcast(connection_id, change)
            .await?;
        self.presence.touch(&document_id, &user_id);
        self.evict(applied.report.failed.clone());

        Ok(applied)
    }

    /// Apply an edit that did not come from a connection and relay it to all
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub async fn edit(&self, change: ChangeEvent) -> Result<Applied, SyncError> {
        let applied = self.broadcaster.apply_change(None, change).await?;
        self.evict(applied.report.failed.clone());
        Ok(applied)
    }

    /// Delete a document and tell its subscribers with a `delete` change.
    ///
    /// Subscribers stay bound; further edits to the id are `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub async fn delete_document(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Document, SyncError> {
        let document = self.store.delete(document_id).await?;

        let change = ChangeEvent {
            user_id: user_id.to_string(),
            document_id: document.id.clone(),
            content: String::new(),
            timestamp: now_millis(),
            change_type: ChangeType::Delete,
        };
        let report = self
            .broadcaster
            .broadcast(document_id, ServerEvent::Change(change), None);
        info!(document = %document_id, notified = report.delivered, "Document deleted");
        self.evict(report.failed);

        Ok(document)
    }

    /// Handle a transport-level disconnect.
    ///
    /// Behaves like a leave of whatever the connection had joined; returns
    /// that binding, or `None` if the connection never joined (no events are
    /// emitted then).
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Binding> {
        let binding = self.registry.deregister(connection_id)?;

        let failed = self.depart(&binding);
        self.evict(failed);

        info!(connection = %connection_id, document = %binding.document_id, "Disconnected while joined");
        Some(binding)
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let registry = self.registry.stats();
        HubStats {
            connection_count: registry.connection_count,
            active_documents: registry.document_count,
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Presence bookkeeping after `binding` was cleared.
    ///
    /// The user leaves the presence set only if no other connection is still
    /// bound to the document as that user. Returns connections that failed to
    /// receive the departure notice.
    fn depart(&self, binding: &Binding) -> Vec<ConnectionId> {
        let Binding {
            document_id,
            user_id,
        } = binding;

        // Joins bind before touching presence; the check runs under the
        // presence lock.
        let left = self.presence.leave_unless(document_id, user_id, || {
            self.registry.is_user_bound(document_id, user_id)
        });
        if !left {
            debug!(document = %document_id, user = %user_id, "User still present or already gone");
            return Vec::new();
        }

        info!(document = %document_id, user = %user_id, "User left");
        let notice = ServerEvent::UserLeft(self.notice(document_id, user_id));
        self.broadcaster.broadcast(document_id, notice, None).failed
    }

    /// Disconnect connections whose outbound queue rejected an event.
    ///
    /// Deregistering closes the queue, which ends the connection's worker.
    /// Departure notices may fail in turn, so this drains a worklist.
    fn evict(&self, failed: Vec<ConnectionId>) {
        if failed.is_empty() {
            return;
        }
        self.delivery_failures
            .fetch_add(failed.len() as u64, Ordering::Relaxed);

        let mut queue: VecDeque<ConnectionId> = failed.into();
        while let Some(connection_id) = queue.pop_front() {
            if !self.registry.is_registered(&connection_id) {
                continue;
            }
            warn!(connection = %connection_id, "Evicting unresponsive connection");
            self.evictions.fetch_add(1, Ordering::Relaxed);

            if let Some(binding) = self.registry.deregister(&connection_id) {
                let more = self.depart(&binding);
                self.delivery_failures
                    .fetch_add(more.len() as u64, Ordering::Relaxed);
                queue.extend(more);
            }
        }
    }

    fn notice(&self, document_id: &str, user_id: &str) -> PresenceNotice {
        PresenceNotice {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
            active_users: self.presence.snapshot(document_id),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of documents with at least one subscriber.
    pub active_documents: usize,
    /// Events that could not be queued for a subscriber.
    pub delivery_failures: u64,
    /// Connections disconnected after a delivery failure.
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, MemoryDocumentStore};
    use tandem_protocol::Membership;

    fn hub() -> SessionHub {
        hub_with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    fn hub_with_capacity(outbound_capacity: usize) -> SessionHub {
        let store = MemoryDocumentStore::new();
        store.insert(Document::new("doc1", "First", ""));
        store.insert(Document::new("doc2", "Second", ""));
        SessionHub::with_config(Arc::new(store), HubConfig { outbound_capacity })
    }

    fn drain(rx: &mut Outbound) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn joined(user: &str, document: &str, active: &[&str]) -> ServerEvent {
        ServerEvent::UserJoined(PresenceNotice {
            user_id: user.into(),
            document_id: document.into(),
            active_users: active.iter().map(|u| u.to_string()).collect(),
        })
    }

    fn left(user: &str, document: &str, active: &[&str]) -> ServerEvent {
        ServerEvent::UserLeft(PresenceNotice {
            user_id: user.into(),
            document_id: document.into(),
            active_users: active.iter().map(|u| u.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_join_notifies_everyone_including_joiner() {
        let hub = hub();
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let mut rx_a = hub.connect(&a).unwrap();
        let mut rx_b = hub.connect(&b).unwrap();

        hub.join(&a, "doc1", "alice").await.unwrap();
        assert_eq!(drain(&mut rx_a), vec![joined("alice", "doc1", &["alice"])]);

        hub.join(&b, "doc1", "bob").await.unwrap();
        let expected = joined("bob", "doc1", &["alice", "bob"]);
        assert_eq!(drain(&mut rx_a), vec![expected.clone()]);
        assert_eq!(drain(&mut rx_b), vec![expected]);
    }

    #[tokio::test]
    async fn test_change_reaches_others_only() {
        let hub = hub();
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let mut rx_a = hub.connect(&a).unwrap();
        let mut rx_b = hub.connect(&b).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        hub.join(&b, "doc1", "bob").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let change = ChangeEvent::update("alice", "doc1", "hello");
        hub.handle(&a, ClientEvent::Change(change.clone()))
            .await
            .unwrap();

        assert_eq!(drain(&mut rx_b), vec![ServerEvent::Change(change)]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(hub.store().get("doc1").await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn test_change_unknown_document() {
        let hub = hub();
        let a = ConnectionId::new("a");
        let _rx_a = hub.connect(&a).unwrap();

        let result = hub
            .change(&a, ChangeEvent::update("alice", "missing", "x"))
            .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_join_unknown_document() {
        let hub = hub();
        let a = ConnectionId::new("a");
        let mut rx_a = hub.connect(&a).unwrap();

        let result = hub.join(&a, "missing", "alice").await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert!(hub.registry().binding(&a).is_none());
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_emits_single_user_left() {
        let hub = hub();
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let mut rx_a = hub.connect(&a).unwrap();
        let _rx_b = hub.connect(&b).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        hub.join(&b, "doc1", "bob").await.unwrap();
        drain(&mut rx_a);

        assert_eq!(hub.disconnect(&b), Some(Binding::new("doc1", "bob")));

        assert_eq!(drain(&mut rx_a), vec![left("bob", "doc1", &["alice"])]);
        assert_eq!(hub.presence().snapshot("doc1"), vec!["alice"]);
        assert_eq!(hub.disconnect(&b), None);
    }

    #[tokio::test]
    async fn test_disconnect_without_join_is_noop() {
        let hub = hub();
        let (a, c) = (ConnectionId::new("a"), ConnectionId::new("c"));
        let mut rx_a = hub.connect(&a).unwrap();
        let _rx_c = hub.connect(&c).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        drain(&mut rx_a);

        assert_eq!(hub.disconnect(&c), None);
        assert!(drain(&mut rx_a).is_empty());
        assert!(!hub.registry().is_registered(&c));
    }

    #[tokio::test]
    async fn test_leave_and_mismatched_leave() {
        let hub = hub();
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let mut rx_a = hub.connect(&a).unwrap();
        let mut rx_b = hub.connect(&b).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        hub.join(&b, "doc1", "bob").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(&b, ClientEvent::Leave(Membership::new("doc2", "bob")))
            .await
            .unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert!(hub.presence().is_present("doc1", "bob"));

        assert!(hub.leave(&b, "doc1", "bob"));
        assert_eq!(drain(&mut rx_a), vec![left("bob", "doc1", &["alice"])]);
        // The leaver is no longer subscribed.
        assert!(drain(&mut rx_b).is_empty());
        assert!(hub.registry().is_registered(&b));
    }

    #[tokio::test]
    async fn test_rejoin_other_document_supersedes() {
        let hub = hub();
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let mut rx_a = hub.connect(&a).unwrap();
        let mut rx_b = hub.connect(&b).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        hub.join(&b, "doc1", "bob").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.join(&a, "doc2", "alice").await.unwrap();

        assert_eq!(drain(&mut rx_b), vec![left("alice", "doc1", &["bob"])]);
        assert_eq!(drain(&mut rx_a), vec![joined("alice", "doc2", &["alice"])]);
        assert_eq!(hub.registry().subscribers_of("doc1"), vec![b.clone()]);
        assert_eq!(hub.registry().subscribers_of("doc2"), vec![a.clone()]);
    }

    #[tokio::test]
    async fn test_same_user_on_two_connections() {
        let hub = hub();
        let (a1, a2, b) = (
            ConnectionId::new("a1"),
            ConnectionId::new("a2"),
            ConnectionId::new("b"),
        );
        let _rx_a1 = hub.connect(&a1).unwrap();
        let _rx_a2 = hub.connect(&a2).unwrap();
        let mut rx_b = hub.connect(&b).unwrap();
        hub.join(&a1, "doc1", "alice").await.unwrap();
        hub.join(&a2, "doc1", "alice").await.unwrap();
        hub.join(&b, "doc1", "bob").await.unwrap();
        drain(&mut rx_b);

        hub.disconnect(&a1);
        assert!(drain(&mut rx_b).is_empty());
        assert!(hub.presence().is_present("doc1", "alice"));

        hub.disconnect(&a2);
        assert_eq!(drain(&mut rx_b), vec![left("alice", "doc1", &["bob"])]);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_subscriber() {
        let hub = hub_with_capacity(1);
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let mut rx_a = hub.connect(&a).unwrap();
        let mut rx_b = hub.connect(&b).unwrap();

        hub.join(&a, "doc1", "alice").await.unwrap();
        drain(&mut rx_a);
        hub.join(&b, "doc1", "bob").await.unwrap();
        drain(&mut rx_a);
        // b never reads: its single slot holds its own join notice.

        let applied = hub
            .change(&a, ChangeEvent::update("alice", "doc1", "hi"))
            .await
            .unwrap();

        assert_eq!(applied.report.failed, vec![b.clone()]);
        assert!(!hub.registry().is_registered(&b));
        assert_eq!(hub.presence().snapshot("doc1"), vec!["alice"]);
        assert_eq!(drain(&mut rx_a), vec![left("bob", "doc1", &["alice"])]);

        assert_eq!(*rx_b.recv().await.unwrap(), joined("bob", "doc1", &["alice", "bob"]));
        assert!(rx_b.recv().await.is_none());

        let stats = hub.stats();
        assert_eq!(stats.delivery_failures, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_malformed_and_ping() {
        let hub = hub();
        let a = ConnectionId::new("a");
        let mut rx_a = hub.connect(&a).unwrap();

        let result = hub
            .handle(&a, ClientEvent::Join(Membership::new("", "alice")))
            .await;
        assert!(matches!(result, Err(SyncError::MalformedMessage(_))));

        hub.handle(&a, ClientEvent::Ping).await.unwrap();
        assert_eq!(drain(&mut rx_a), vec![ServerEvent::Pong]);
    }

    #[tokio::test]
    async fn test_edit_reaches_all_subscribers() {
        let hub = hub();
        let a = ConnectionId::new("a");
        let mut rx_a = hub.connect(&a).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        drain(&mut rx_a);

        let applied = hub
            .edit(ChangeEvent::update("api", "doc1", "from http"))
            .await
            .unwrap();

        assert_eq!(applied.document.content, "from http");
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document_notifies_subscribers() {
        let hub = hub();
        let a = ConnectionId::new("a");
        let mut rx_a = hub.connect(&a).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        drain(&mut rx_a);

        let deleted = hub.delete_document("doc1", "api").await.unwrap();
        assert_eq!(deleted.id, "doc1");

        match drain(&mut rx_a).as_slice() {
            [ServerEvent::Change(change)] => {
                assert_eq!(change.change_type, ChangeType::Delete);
                assert_eq!(change.document_id, "doc1");
                assert!(change.content.is_empty());
            }
            other => panic!("Expected a delete change, got {:?}", other),
        }

        let result = hub
            .change(&a, ChangeEvent::update("alice", "doc1", "late"))
            .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert!(matches!(
            hub.delete_document("doc1", "api").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_keeps_user_present() {
        let hub = hub();
        let (old, new) = (ConnectionId::new("old"), ConnectionId::new("new"));
        let mut rx_old = hub.connect(&old).unwrap();
        let mut rx_new = hub.connect(&new).unwrap();
        hub.join(&old, "doc1", "alice").await.unwrap();
        drain(&mut rx_old);

        hub.join(&new, "doc1", "alice").await.unwrap();
        hub.disconnect(&old);

        assert_eq!(drain(&mut rx_new), vec![joined("alice", "doc1", &["alice"])]);
        assert_eq!(hub.presence().snapshot("doc1"), vec!["alice"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reload_keeps_user_present() {
        let hub = Arc::new(hub());

        for round in 0..200 {
            let old = ConnectionId::new(format!("old-{}", round));
            let new = ConnectionId::new(format!("new-{}", round));
            let _rx_old = hub.connect(&old).unwrap();
            let _rx_new = hub.connect(&new).unwrap();
            hub.join(&old, "doc1", "alice").await.unwrap();

            let leaving = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.disconnect(&old) })
            };
            let joining = {
                let hub = Arc::clone(&hub);
                let new = new.clone();
                tokio::spawn(async move { hub.join(&new, "doc1", "alice").await })
            };
            leaving.await.unwrap();
            joining.await.unwrap().unwrap();

            assert!(
                hub.presence().is_present("doc1", "alice"),
                "alice lost from presence in round {}",
                round
            );
            hub.disconnect(&new);
            assert!(!hub.presence().is_present("doc1", "alice"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_changes_last_write_wins() {
        let hub = Arc::new(hub());
        let (a, b) = (ConnectionId::new("a"), ConnectionId::new("b"));
        let _rx_a = hub.connect(&a).unwrap();
        let _rx_b = hub.connect(&b).unwrap();
        hub.join(&a, "doc1", "alice").await.unwrap();
        hub.join(&b, "doc1", "bob").await.unwrap();

        let x = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                hub.change(&a, ChangeEvent::update("alice", "doc1", "X"))
                    .await
                    .unwrap()
            })
        };
        let y = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                hub.change(&b, ChangeEvent::update("bob", "doc1", "Y"))
                    .await
                    .unwrap()
            })
        };
        let (x, y) = (x.await.unwrap(), y.await.unwrap());

        let last = if x.document.revision > y.document.revision { x } else { y };
        let stored = hub.store().get("doc1").await.unwrap();

        assert!(stored.content == "X" || stored.content == "Y");
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.content, last.document.content);
    }
}
