//! Transport adapter layer for the scadalink runtime
//!
//! The runtime never touches sockets directly: it talks to a
//! [`MessageChannel`] for sending and receives decoded messages and
//! connection events through an mpsc stream of [`TransportEvent`]s. A
//! [`Connector`] produces channels for a resolved remote address.
//!
//! This crate provides the trait boundary plus a TCP implementation with a
//! length-prefixed binary frame codec.

pub mod channel;
pub mod codec;
pub mod tcp;

pub use channel::{Connector, MessageChannel, TransportEvent};
pub use codec::{decode_payload, encode_frame, MAX_FRAME_LENGTH};
pub use tcp::{TcpChannel, TcpConnector, TcpConnectorSettings};
