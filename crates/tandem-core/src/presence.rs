//! Presence tracking for Tandem.
//!
//! Presence records which users are currently viewing each document.
//! A document's presence set is created on its first join and dropped as soon
//! as it becomes empty.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_protocol::{now_millis, DocumentId, UserId};
use tracing::debug;

/// Presence state for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: UserId,
    /// When the user joined.
    pub joined_at: u64,
    /// Last activity timestamp.
    pub last_seen: u64,
}

impl PresenceState {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        let now = now_millis();
        Self {
            user_id: user_id.into(),
            joined_at: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = self.last_seen.max(now_millis());
    }
}

/// Users present on one document, ordered by user id.
#[derive(Debug, Default)]
pub struct Presence {
    members: BTreeMap<UserId, PresenceState>,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns `true` if the user was not present yet.
    pub fn join(&mut self, user_id: &str) -> bool {
        if self.members.contains_key(user_id) {
            return false;
        }
        self.members
            .insert(user_id.to_string(), PresenceState::new(user_id));
        true
    }

    /// Remove a member, returning its state if it was present.
    pub fn leave(&mut self, user_id: &str) -> Option<PresenceState> {
        self.members.remove(user_id)
    }

    pub fn touch(&mut self, user_id: &str) {
        if let Some(state) = self.members.get_mut(user_id) {
            state.touch();
        }
    }

    #[must_use]
    pub fn is_present(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    /// User ids in ascending order.
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        self.members.keys().cloned().collect()
    }

    #[must_use]
    pub fn members(&self) -> Vec<PresenceState> {
        self.members.values().cloned().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Presence sets for all documents.
///
/// Each operation runs under the document's shard lock, so joins and leaves on
/// one document are totally ordered.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    documents: DashMap<DocumentId, Presence>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user to a document's presence set.
    ///
    /// Idempotent; returns `true` if the user was newly added.
    pub fn join(&self, document_id: &str, user_id: &str) -> bool {
        let joined = self
            .documents
            .entry(document_id.to_string())
            .or_default()
            .join(user_id);

        if joined {
            debug!(document = %document_id, user = %user_id, "Presence: user joined");
        }
        joined
    }

    /// Remove a user from a document's presence set.
    ///
    /// Leaving a set the user is not in is a no-op returning `false`.
    pub fn leave(&self, document_id: &str, user_id: &str) -> bool {
        self.leave_unless(document_id, user_id, || false)
    }

    /// Remove a user unless `retain` says otherwise.
    ///
    /// `retain` runs while the document's shard lock is held, so a concurrent
    /// `join` on the same document is ordered either before the check or after
    /// the removal. It must not touch this tracker.
    pub fn leave_unless(
        &self,
        document_id: &str,
        user_id: &str,
        retain: impl FnOnce() -> bool,
    ) -> bool {
        let left = match self.documents.get_mut(document_id) {
            Some(mut presence) => {
                presence.is_present(user_id) && !retain() && presence.leave(user_id).is_some()
            }
            None => return false,
        };

        // Re-checked under the shard lock so a concurrent join is never lost.
        self.documents.remove_if(document_id, |_, p| p.is_empty());

        if left {
            debug!(document = %document_id, user = %user_id, "Presence: user left");
        }
        left
    }

    /// Refresh a user's last seen timestamp.
    pub fn touch(&self, document_id: &str, user_id: &str) {
        if let Some(mut presence) = self.documents.get_mut(document_id) {
            presence.touch(user_id);
        }
    }

    /// User ids present on a document, sorted ascending.
    #[must_use]
    pub fn snapshot(&self, document_id: &str) -> Vec<UserId> {
        self.documents
            .get(document_id)
            .map(|p| p.user_ids())
            .unwrap_or_default()
    }

    /// Full presence states for a document, sorted by user id.
    #[must_use]
    pub fn members(&self, document_id: &str) -> Vec<PresenceState> {
        self.documents
            .get(document_id)
            .map(|p| p.members())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_present(&self, document_id: &str, user_id: &str) -> bool {
        self.documents
            .get(document_id)
            .is_some_and(|p| p.is_present(user_id))
    }

    /// Number of documents with at least one present user.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}
