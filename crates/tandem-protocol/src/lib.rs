//! # tandem-protocol
//!
//! Wire protocol for the Tandem real-time document synchronization service.
//!
//! ## Events
//!
//! Clients send:
//!
//! - `join` / `leave` - Enter or exit a document session
//! - `change` - Replace a document's content
//! - `ping` - Keepalive
//!
//! The server sends `connected`, relayed `change` events, `userJoined` /
//! `userLeft` presence notices, `error` and `pong`.
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::{codec, ClientEvent, Membership};
//!
//! let join = ClientEvent::Join(Membership::new("doc1", "alice"));
//!
//! let text = codec::encode_json(&join).unwrap();
//! let back: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(back, join);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError};
pub use events::{
    now_millis, ChangeEvent, ChangeType, ClientEvent, DocumentId, ErrorNotice, Membership,
    PresenceNotice, ServerEvent, UserId, Welcome,
};
pub use version::{Version, PROTOCOL_VERSION};
