//! Wire vocabulary shared by both duplink roles.
//!
//! This crate provides:
//! - Typed link message records and their JSON codec ([`message`])
//! - Protocol version and compatibility rules ([`proto`])
//! - WebSocket close codes reserved by the link protocol ([`close`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod close;
pub mod message;
pub mod proto;

pub use close::CloseCode;
pub use message::{Message, MsgType, WireError};
pub use proto::ProtoVersion;

/// Transaction id correlating a request with its response messages.
///
/// Server-originated transactions use the positive series `1, 2, 3, …`;
/// client-originated ones use `-1, -2, -3, …`. Zero is reserved.
pub type Tid = i64;

/// Locally-unique id of one event listener registration.
pub type SubId = u64;

/// User-defined version number of a link schema. Both peers must agree.
pub type LinkVersion = u32;
