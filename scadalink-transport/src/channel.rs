//! Transport boundary traits and events
//!
//! # Architecture
//!
//! The connection runtime owns exactly one channel per connected lifetime.
//! The channel's reader side pushes [`TransportEvent`]s into an mpsc sender
//! handed over at connect time; the runtime's event pump consumes them. The
//! writer side is driven through [`MessageChannel::send`].
//!
//! # Why a Trait?
//! Keeping the runtime behind `MessageChannel`/`Connector` allows:
//! - **Testability**: the runtime's unit tests use in-memory channels
//! - **Polymorphism**: TCP today, other stream transports later
//! - **Ownership clarity**: the state machine owns the channel for its
//!   connected lifetime and disposes it on close

use async_trait::async_trait;
use scadalink_core::{LinkError, LinkResult, Message};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events pushed from the transport to the connection runtime
#[derive(Debug)]
pub enum TransportEvent {
    /// The underlying session is open and ready for traffic
    SessionOpened,
    /// The underlying session closed (EOF, shutdown, or fatal error)
    SessionClosed,
    /// No bytes were received for the configured idle period
    SessionIdle,
    /// A decoded message arrived
    MessageReceived(Message),
    /// A non-fatal transport error was observed
    ExceptionCaught(LinkError),
}

/// Send side of one connected transport session
///
/// Sequence generation lives here: the channel owns the per-connection
/// counter and the correlation engine only tracks the values it is given.
#[async_trait]
pub trait MessageChannel: Send + Sync + fmt::Debug {
    /// Allocate the next outgoing sequence number (starts at 1, 0 is never
    /// allocated and means "unassigned")
    fn next_sequence(&self) -> u64;

    /// Encode and send one message
    ///
    /// The message must carry its final sequence number; it is immutable
    /// from the caller's point of view once handed over.
    async fn send(&self, message: Message) -> LinkResult<()>;

    /// Close the session
    ///
    /// Closing is asynchronous: the reader side observes the shutdown and
    /// emits `SessionClosed` through the event stream.
    async fn close(&self);
}

/// Factory for transport sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a resolved remote address
    ///
    /// Events for the new session are delivered through `events`. On success
    /// the connector has already emitted `SessionOpened`.
    async fn connect(
        &self,
        address: SocketAddr,
        events: mpsc::Sender<TransportEvent>,
    ) -> LinkResult<Arc<dyn MessageChannel>>;
}
