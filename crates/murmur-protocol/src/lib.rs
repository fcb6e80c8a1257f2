//! # murmur-protocol
//!
//! Wire types shared by every murmur component.
//!
//! - [`frames`] - JSON frames on the live client connection
//! - [`envelope`] - envelopes a broker topic pushes to subscribers
//! - [`api`] - HTTP request and response bodies
//! - [`codec`] - MessagePack queue payloads and frame helpers
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, ClientFrame};
//!
//! let frame = codec::decode_frame(
//!     r#"{"messageType":"changeChannel","channel":"alpha"}"#,
//!     1024,
//! )
//! .unwrap();
//! assert_eq!(frame, ClientFrame::ChangeChannel { channel: "alpha".into() });
//! ```

pub mod api;
pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{
    attr, parse_envelope, AttributeValue, BrokerEnvelope, DataType, MessageAttributes,
    MessageType, Notification, SubscriptionConfirmation, UnsubscribeConfirmation,
    MESSAGE_TYPE_HEADER,
};
pub use frames::{ClientFrame, HistoryEntry, ServerFrame};
