//! Session negotiation layer
//!
//! A [`ClientConnection`] specializes the state machine's
//! `on_connection_established` hook: as soon as the transport is connected
//! it sends a CREATE_SESSION request carrying the client's required protocol
//! version, bounded by the configured message timeout. A positive
//! acknowledgement binds the connection; an error reply, an unexpected
//! reply, or a timeout tears it down with a descriptive reason.
//!
//! This is the only place version compatibility is enforced, and it runs
//! before any other application message is considered valid on the
//! connection.

use crate::connection::{Connection, ConnectionHandler, ConnectionState};
use crate::messenger::{Messenger, ReplyListener};
use scadalink_core::{codes, fields, ConnectionOptions, LinkError, Message, Value};
use scadalink_transport::Connector;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// A client connection that binds itself through the session handshake
pub struct ClientConnection {
    connection: Arc<Connection>,
    version: String,
}

impl ClientConnection {
    /// Create a client connection requiring the given protocol version
    pub fn new(
        address: impl Into<String>,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        version: impl Into<String>,
    ) -> Arc<Self> {
        let connection = Connection::new(address, options, connector);
        let client = Arc::new(Self {
            connection,
            version: version.into(),
        });
        // bind the concrete weak first so downgrade infers ClientConnection,
        // then let the annotation unsize it
        let weak = Arc::downgrade(&client);
        let handler: Weak<dyn ConnectionHandler> = weak;
        client.connection.set_handler(handler);
        client
    }

    /// The underlying state machine
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The correlation engine, for application protocols once Bound
    pub fn messenger(&self) -> &Arc<Messenger> {
        self.connection.messenger()
    }

    /// Request the connection to come up (idempotent)
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Request a graceful teardown
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch the lifecycle state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }
}

impl ConnectionHandler for ClientConnection {
    fn on_connection_established(&self, connection: &Arc<Connection>) {
        let connection = connection.clone();
        let version = self.version.clone();
        tokio::spawn(async move {
            let request = Message::new(codes::CREATE_SESSION)
                .with_field(fields::VERSION, Value::String(version));
            let listener = Arc::new(SessionReplyListener {
                connection: Arc::downgrade(&connection),
            });
            let timeout = connection.options().message_timeout();
            connection
                .messenger()
                .send_request(request, listener, timeout)
                .await;
        });
    }

    fn on_connection_bound(&self, _connection: &Arc<Connection>) {
        log::info!("Session established (version {})", self.version);
    }
}

/// Decides Bound or teardown from the handshake reply
struct SessionReplyListener {
    connection: Weak<Connection>,
}

impl ReplyListener for SessionReplyListener {
    fn reply(&self, message: Message) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if let Some(detail) = message.error_info() {
            connection.disconnect_with(LinkError::Handshake(detail.to_string()));
        } else if message.command_code() == codes::ACK {
            connection.set_session(message);
            connection.request_bound();
        } else {
            connection.disconnect_with(LinkError::Handshake(format!(
                "Unexpected reply 0x{:04X} to session request",
                message.command_code()
            )));
        }
    }

    fn timed_out(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.disconnect_with(LinkError::Handshake(
                "Session request timed out".to_string(),
            ));
        }
    }
}
