//! # tandem-core
//!
//! Session and broadcast engine for the Tandem document sync service.
//!
//! This crate provides the building blocks shared by every connection:
//!
//! - **Store** - Authoritative document state behind the [`DocumentStore`] trait
//! - **Presence** - Which users are viewing each document
//! - **Registry** - Which connection has joined which document
//! - **Broadcaster** - Applies edits and fans them out to subscribers
//! - **Hub** - Connection lifecycle: connect, join, leave, change, disconnect
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│ Broadcaster │────▶│   Store     │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                        │        │              │
//!                        ▼        ▼              ▼
//!               ┌─────────────┐ ┌─────────────────────┐
//!               │  Presence   │ │      Registry       │
//!               └─────────────┘ └─────────────────────┘
//! ```
//!
//! Concurrent edits are last-write-wins: each edit replaces the whole content
//! and the store keeps whichever replacement it applied last.

pub mod broadcaster;
pub mod error;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod store;

pub use broadcaster::{Applied, BroadcastReport, ChangeBroadcaster};
pub use error::SyncError;
pub use hub::{HubConfig, HubStats, SessionHub};
pub use presence::{Presence, PresenceState, PresenceTracker};
pub use registry::{Binding, ConnectionId, Outbound, RegistryStats, SessionRegistry};
pub use store::{Document, DocumentPatch, DocumentStore, MemoryDocumentStore, NewDocument};
