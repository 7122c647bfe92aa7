//! Change broadcasting.
//!
//! The broadcaster applies an incoming edit to the document store and fans it
//! out to every subscriber of the document except the connection it came
//! from. Delivery is best-effort per recipient: failures are reported back to
//! the caller, never raised.

use crate::error::SyncError;
use crate::registry::{ConnectionId, SessionRegistry};
use crate::store::{Document, DocumentPatch, DocumentStore};
use std::sync::Arc;
use tandem_protocol::{ChangeEvent, ServerEvent};
use tracing::{debug, trace, warn};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers whose queue rejected the event. They should be evicted.
    pub failed: Vec<ConnectionId>,
}

/// An edit that reached the store.
#[derive(Debug, Clone)]
pub struct Applied {
    /// Document state right after the edit.
    pub document: Document,
    pub report: BroadcastReport,
}

/// Applies edits and relays them to subscribers.
pub struct ChangeBroadcaster {
    store: Arc<dyn DocumentStore>,
    registry: Arc<SessionRegistry>,
}

impl ChangeBroadcaster {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Apply an edit sent by `origin` and relay it to the other subscribers.
    ///
    /// Concurrent edits of one document are last-write-wins: whichever
    /// replacement the store serializes last is the content that remains.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist; nothing is relayed
    /// in that case.
    pub async fn apply_and_broadcast(
        &self,
        origin: &ConnectionId,
        change: ChangeEvent,
    ) -> Result<Applied, SyncError> {
        self.apply_change(Some(origin), change).await
    }

    /// Apply an edit and relay it to every subscriber except `origin`.
    ///
    /// Edits without an origin connection (e.g. from the HTTP API) reach all
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub async fn apply_change(
        &self,
        origin: Option<&ConnectionId>,
        change: ChangeEvent,
    ) -> Result<Applied, SyncError> {
        let document_id = change.document_id.clone();

        self.store.get(&document_id).await?;
        let document = self
            .store
            .upsert(&document_id, DocumentPatch::content(change.content.clone()))
            .await?;

        debug!(
            document = %document_id,
            user = %change.user_id,
            revision = document.revision,
            change_type = ?change.change_type,
            "Applied change"
        );

        let report = self.broadcast(&document_id, ServerEvent::Change(change), origin);
        Ok(Applied { document, report })
    }

    /// Queue an event for every subscriber of a document except `exclude`.
    pub fn broadcast(
        &self,
        document_id: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let event = Arc::new(event);
        let mut report = BroadcastReport::default();

        for subscriber in self.registry.subscribers_of(document_id) {
            if exclude == Some(&subscriber) {
                continue;
            }

            match self.registry.send_to(&subscriber, Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(SyncError::NotRegistered(_)) => {
                    // Deregistered after the subscriber snapshot was taken.
                    trace!(connection = %subscriber, "Skipping departed subscriber");
                }
                Err(e) => {
                    warn!(
                        document = %document_id,
                        connection = %subscriber,
                        error = %e,
                        "Delivery failed"
                    );
                    report.failed.push(subscriber);
                }
            }
        }

        trace!(
            document = %document_id,
            event = event.name(),
            recipients = report.delivered,
            failures = report.failed.len(),
            "Broadcast"
        );
        report
    }
}
