//! Connection/messaging runtime for scadalink
//!
//! This crate is the shared substrate every scadalink protocol client sits
//! on: one logical connection with a supervised lifecycle, a versioned
//! session handshake, and request/reply correlation with timeout
//! supervision over a long-lived, unreliable transport.
//!
//! # Architecture
//!
//! - [`connection::Connection`]: the lifecycle state machine
//!   (Closed → Lookup/Connecting → Connected → Bound → Closing → Closed)
//! - [`messenger::Messenger`]: the correlation engine matching asynchronous
//!   replies to outstanding requests and enforcing timeouts
//! - [`client::ClientConnection`]: the session negotiation layer that sends
//!   the versioned CREATE_SESSION handshake before declaring the connection
//!   usable
//! - [`keepalive::KeepAlive`]: ping policy wired to the transport's
//!   read-idle event
//!
//! # Connection Flow
//!
//! 1. **Lookup**: resolve the remote address (cached for reconnects)
//! 2. **Connect**: open the transport with the configured connect timeout
//! 3. **Handshake**: exchange CREATE_SESSION/ACK with the protocol version
//! 4. **Bound**: application protocols exchange requests through the
//!    messenger until the connection closes

pub mod client;
pub mod connection;
pub mod keepalive;
pub mod messenger;

pub use client::ClientConnection;
pub use connection::{Connection, ConnectionHandler, ConnectionState, ConnectionStateListener};
pub use keepalive::KeepAlive;
pub use messenger::{MessageHandler, Messenger, ReplyListener};

#[cfg(test)]
pub(crate) mod testing;
