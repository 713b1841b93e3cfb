//! Bidirectional, symmetric RPC-and-event links over WebSocket.
//!
//! Two peers, a server that accepts connections and a client that dials
//! them, negotiate a user-defined link schema and then exchange typed
//! events (fire-and-forget, subscribable from either side) and typed
//! function calls (request/response with structured errors) over one
//! long-lived duplex channel.
//!
//! A protocol is described once and used by both roles:
//!
//! ```no_run
//! use duplink::{Event, Function, InboundEvent, InboundFunction, Link,
//!               OutboundEvent, OutboundFunction, Protocol, Registry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Temp { c: f64 }
//!
//! impl Event for Temp { const NAME: &'static str = "Temp"; }
//! impl InboundEvent for Temp {}
//! impl OutboundEvent for Temp {}
//!
//! struct Ping;
//! #[derive(Serialize, Deserialize)]
//! struct PingParams { seq: u64 }
//! #[derive(Serialize, Deserialize)]
//! struct PingResults { pong: u64 }
//!
//! impl Function for Ping {
//!     const NAME: &'static str = "Ping";
//!     type Params = PingParams;
//!     type Results = PingResults;
//! }
//! impl InboundFunction for Ping {}
//! impl OutboundFunction for Ping {}
//!
//! struct Sensor;
//!
//! impl Protocol for Sensor {
//!     fn link_version(&self) -> u32 { 1 }
//!
//!     fn define(&mut self, reg: &mut Registry) {
//!         reg.bidirectional_event::<Temp>();
//!         reg.bidirectional_function::<Ping, _>(|p: PingParams| {
//!             Ok(PingResults { pong: p.seq })
//!         });
//!     }
//!
//!     fn on_ready(&mut self, link: Link) {
//!         let _ = link.emit(&Temp { c: 21.5 });
//!     }
//! }
//! ```
//!
//! Servers run [`server::run`] with a [`server::ServerState`] and a
//! protocol factory; clients run [`client::run`]. Once the handshake
//! completes, [`Protocol::on_ready`] hands the application a [`Link`]
//! handle for emitting events, calling remote functions and registering
//! listeners from any thread.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
/// Dial loop and reconnection policy for the client role.
pub mod client;
/// Endpoint and per-link configuration.
pub mod config;
mod error;
mod link;
mod schema;
/// Accept loop and shared server state.
pub mod server;
mod subscription;
mod supervisor;
mod transaction;

pub use config::{ClientConfig, LinkConfig, ReconnectConfig, ServerConfig};
pub use duplink_common::{CloseCode, LinkVersion, ProtoVersion, SubId, Tid};
pub use error::LinkError;
pub use link::{Link, Role};
pub use schema::{
    Event, Function, InboundEvent, InboundFunction, OutboundEvent, OutboundFunction, Protocol,
    Registry,
};
pub use subscription::EventSubscription;
