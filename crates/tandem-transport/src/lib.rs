//! # tandem-transport
//!
//! Client-side transport for the Tandem document sync service.
//!
//! - **ReconnectPolicy** - Bounded retries with fixed or exponential delay
//! - **SyncClient** - WebSocket client speaking the Tandem protocol
//!
//! ```rust,ignore
//! use tandem_transport::{ReconnectPolicy, SyncClient};
//!
//! let mut client = SyncClient::connect("ws://127.0.0.1:8080/ws", &ReconnectPolicy::default()).await?;
//! client.join("doc1", "alice").await?;
//! while let Some(event) = client.next_event().await? {
//!     // Apply relayed changes and presence notices
//! }
//! ```

pub mod error;
pub mod reconnect;

#[cfg(feature = "websocket")]
pub mod client;

pub use error::TransportError;
pub use reconnect::{Backoff, ReconnectPolicy};

#[cfg(feature = "websocket")]
pub use client::{SyncClient, WireFormat};
