//! Document storage.
//!
//! The store owns the authoritative state of every document. Edits replace
//! the whole content; the most recent call to reach the store wins.

use crate::error::SyncError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tandem_protocol::{now_millis, DocumentId};
use tracing::{debug, trace, warn};

/// Name given to documents created without one.
pub const DEFAULT_DOCUMENT_NAME: &str = "Untitled";

/// A shared text document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub content: String,
    /// Number of content replacements applied since creation.
    pub revision: u64,
    /// Creation time in Unix milliseconds.
    pub created_at: u64,
    /// Last replacement time in Unix milliseconds. Never decreases.
    pub last_modified: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Document {
    /// Create a document at revision zero, stamped now.
    #[must_use]
    pub fn new(id: impl Into<DocumentId>, name: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            revision: 0,
            created_at: now,
            last_modified: now,
            created_by: None,
        }
    }

    fn replace_content(&mut self, content: String) {
        self.content = content;
        self.revision += 1;
        self.last_modified = self.last_modified.max(now_millis());
    }
}

/// Partial fields accepted when creating a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewDocument {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Whole-content replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub content: String,
}

impl DocumentPatch {
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Authoritative document state, keyed by document id.
///
/// Implementations must make every single-key operation atomic and visible to
/// all subsequent calls from any task.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document.
    async fn get(&self, id: &str) -> Result<Document, SyncError>;

    /// Replace a document's content, stamping `last_modified`.
    ///
    /// Unknown ids are `NotFound`; documents are only created by [`create`].
    ///
    /// [`create`]: DocumentStore::create
    async fn upsert(&self, id: &str, patch: DocumentPatch) -> Result<Document, SyncError>;

    /// Create a document under a freshly generated id.
    async fn create(&self, fields: NewDocument) -> Result<Document, SyncError>;

    /// Remove a document, returning its last state.
    async fn delete(&self, id: &str) -> Result<Document, SyncError>;

    /// All documents, ordered by id.
    async fn list(&self) -> Result<Vec<Document>, SyncError>;
}

type IdGenerator = Box<dyn Fn() -> DocumentId + Send + Sync>;

/// Volatile document store.
///
/// Contents are lost when the process exits.
pub struct MemoryDocumentStore {
    documents: DashMap<DocumentId, Document>,
    generate_id: IdGenerator,
}

impl MemoryDocumentStore {
    /// Create an empty store issuing UUID v4 ids.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id_generator(|| uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty store with a custom id source.
    #[must_use]
    pub fn with_id_generator(generate_id: impl Fn() -> DocumentId + Send + Sync + 'static) -> Self {
        Self {
            documents: DashMap::new(),
            generate_id: Box::new(generate_id),
        }
    }

    /// Put a document under its own id, replacing any previous one.
    pub fn insert(&self, document: Document) -> Option<Document> {
        debug!(document = %document.id, "Inserting document");
        self.documents.insert(document.id.clone(), document)
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: &str) -> Result<Document, SyncError> {
        self.documents
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    async fn upsert(&self, id: &str, patch: DocumentPatch) -> Result<Document, SyncError> {
        let mut document = self
            .documents
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        document.replace_content(patch.content);
        trace!(document = %id, revision = document.revision, "Replaced content");

        Ok(document.clone())
    }

    async fn create(&self, fields: NewDocument) -> Result<Document, SyncError> {
        loop {
            let id = (self.generate_id)();
            match self.documents.entry(id) {
                Entry::Occupied(occupied) => {
                    warn!(document = %occupied.key(), "Generated document id collides, retrying");
                }
                Entry::Vacant(vacant) => {
                    let mut document = Document::new(
                        vacant.key().clone(),
                        fields.name.unwrap_or_else(|| DEFAULT_DOCUMENT_NAME.to_string()),
                        fields.content.unwrap_or_default(),
                    );
                    document.created_by = fields.created_by;

                    debug!(document = %document.id, "Created document");
                    vacant.insert(document.clone());
                    return Ok(document);
                }
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<Document, SyncError> {
        let (_, document) = self
            .documents
            .remove(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        debug!(document = %id, "Deleted document");
        Ok(document)
    }

    async fn list(&self) -> Result<Vec<Document>, SyncError> {
        let mut documents: Vec<Document> = self.documents.iter().map(|d| d.clone()).collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }
}
