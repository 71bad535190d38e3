//! Connection lifecycle state machine
//!
//! One [`Connection`] owns the lifecycle of one logical link: address
//! resolution, socket connect, session bind, and teardown. Every transition
//! goes through the single serialized entry point `switch_state`; observers
//! registered as [`ConnectionStateListener`]s see each actual change
//! together with its cause.
//!
//! # State Transitions
//! ```text
//! Closed -> Lookup       (connect() without a cached remote address)
//! Closed -> Connecting   (connect() with a cached remote address)
//! Lookup -> Connecting   (lookup succeeded)
//! Lookup -> Closed       (lookup failed or aborted)
//! Connecting -> Connected (transport connected; session handshake starts)
//! Connecting -> Closed   (connect failed or aborted)
//! Connected -> Bound     (session handshake succeeded)
//! Connected/Bound -> Closing (disconnect requested or transport lost)
//! Closing -> Closed      (transport disposed)
//! ```
//!
//! A transition request to the current state is a no-op; that protects
//! against duplicate events from the transport. Lookup and connect failures
//! are not retried here: a supervising component above the state machine
//! owns retry cadence, so `connect()` stays idempotent.

use crate::keepalive::KeepAlive;
use crate::messenger::Messenger;
use scadalink_core::{ConnectionOptions, LinkError, Message};
use scadalink_transport::{Connector, MessageChannel, TransportEvent};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};

/// Lifecycle state of one logical connection
///
/// `Bound` is the only state in which higher-level protocol traffic is
/// valid: the transport is connected and the session handshake succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection (initial and terminal state)
    Closed,
    /// Address resolution in progress
    Lookup,
    /// Socket connect in progress
    Connecting,
    /// Transport connected, session handshake in progress
    Connected,
    /// Session established; application traffic is valid
    Bound,
    /// Graceful teardown in progress
    Closing,
}

impl ConnectionState {
    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "Closed",
            ConnectionState::Lookup => "Lookup",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Bound => "Bound",
            ConnectionState::Closing => "Closing",
        }
    }

    /// True when the connection is usable for application traffic
    pub fn is_bound(&self) -> bool {
        matches!(self, ConnectionState::Bound)
    }
}

/// Observer of actual state changes
///
/// This is the single channel through which callers learn that the
/// connection is down and why. A panicking listener is contained and never
/// breaks delivery to the other listeners.
pub trait ConnectionStateListener: Send + Sync {
    fn state_changed(&self, state: ConnectionState, error: Option<&LinkError>);
}

/// Hooks invoked at the two upward transitions
///
/// The session negotiation layer attaches at `on_connection_established`;
/// resolved once at construction instead of re-checked per call.
pub trait ConnectionHandler: Send + Sync {
    /// Transport is connected; the session handshake should start now
    fn on_connection_established(&self, connection: &Arc<Connection>);

    /// Session handshake succeeded; the connection is usable
    fn on_connection_bound(&self, connection: &Arc<Connection>);
}

/// Everything guarded by the state-machine lock
///
/// This lock and the messenger's pending-table lock are never held at the
/// same time.
struct Shared {
    state: ConnectionState,
    /// Resolved remote address, cached so a reconnect skips lookup
    remote: Option<SocketAddr>,
    channel: Option<Arc<dyn MessageChannel>>,
    /// Session properties from the handshake reply, kept until Closed
    session: Option<Message>,
    /// Cause recorded at Closing so the final Closed transition carries it
    closing_error: Option<Arc<LinkError>>,
    /// Transitions decided but not yet delivered to observers, in decision
    /// order
    notifications: VecDeque<(ConnectionState, Option<Arc<LinkError>>)>,
    /// True while one thread drains the notification queue
    notifying: bool,
}

/// Side effect decided under the lock, executed after it is released
enum Effect {
    None,
    StartLookup,
    StartConnect(SocketAddr),
    Established,
    BoundHook,
    BeginClose(Option<Arc<dyn MessageChannel>>),
    Finalize(Option<Arc<dyn MessageChannel>>),
}

/// Lifecycle state machine for one logical connection
pub struct Connection {
    /// Handle to our own Arc, for the workers this machine spawns
    self_ref: Weak<Connection>,
    address: String,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    messenger: Arc<Messenger>,
    keepalive: KeepAlive,
    handler: Mutex<Option<Weak<dyn ConnectionHandler>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionStateListener>>>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Create a connection for `address` ("host:port")
    ///
    /// The connection starts Closed; nothing happens until `connect()`.
    pub fn new(
        address: impl Into<String>,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let messenger = Messenger::new(options.timeout());
        let keepalive = KeepAlive::from_options(&options);
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            address: address.into(),
            options,
            connector,
            messenger,
            keepalive,
            handler: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            shared: Mutex::new(Shared {
                state: ConnectionState::Closed,
                remote: None,
                channel: None,
                session: None,
                closing_error: None,
                notifications: VecDeque::new(),
                notifying: false,
            }),
            state_tx,
        })
    }

    /// Install the lifecycle hooks (held weakly; the handler owns us, not
    /// the other way around)
    pub fn set_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// The correlation engine for this connection
    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Configuration this connection was created with
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().unwrap().state
    }

    /// Watch the lifecycle state without registering a callback
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Session properties from the handshake reply, while connected
    pub fn session(&self) -> Option<Message> {
        self.shared.lock().unwrap().session.clone()
    }

    /// Register a state listener
    pub fn add_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Remove a previously registered state listener
    pub fn remove_state_listener(&self, listener: &Arc<dyn ConnectionStateListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Request the connection to come up
    ///
    /// A no-op while a connect attempt is already in flight or the
    /// connection is up; otherwise requests Connecting. Idempotent by
    /// design so a supervising reconnect loop can call it freely.
    pub fn connect(&self) {
        {
            let shared = self.shared.lock().unwrap();
            if !matches!(shared.state, ConnectionState::Closed) {
                log::debug!("connect() ignored in state {}", shared.state.as_str());
                return;
            }
        }
        self.switch_state(ConnectionState::Connecting, None);
    }

    /// Request a graceful teardown
    pub fn disconnect(&self) {
        self.switch_state(ConnectionState::Closing, None);
    }

    /// Request a teardown carrying a reason
    pub fn disconnect_with(&self, error: LinkError) {
        self.switch_state(ConnectionState::Closing, Some(Arc::new(error)));
    }

    /// Declare the session handshake complete
    ///
    /// Called by the session negotiation layer; valid only from Connected.
    pub fn request_bound(&self) {
        self.switch_state(ConnectionState::Bound, None);
    }

    /// Record the handshake reply as the live session
    pub fn set_session(&self, session: Message) {
        self.shared.lock().unwrap().session = Some(session);
    }

    /// The single serialized transition point
    ///
    /// Decides the actual new state and queues its notification under the
    /// lock, then delivers notifications and applies the side effect outside
    /// it. Queuing under the decision lock keeps observers seeing
    /// transitions in the order they were decided even when transitions race
    /// on different threads.
    fn switch_state(&self, target: ConnectionState, error: Option<Arc<LinkError>>) {
        use ConnectionState::*;

        let prepared = {
            let mut shared = self.shared.lock().unwrap();
            let current = shared.state;
            let decision = if current == target {
                log::debug!(
                    "Ignoring transition request to current state {}",
                    current.as_str()
                );
                None
            } else {
                match (current, target) {
                    (Closed, Connecting) => {
                        shared.closing_error = None;
                        match shared.remote {
                            Some(addr) => {
                                shared.state = Connecting;
                                Some((Connecting, Effect::StartConnect(addr)))
                            }
                            None => {
                                shared.state = Lookup;
                                Some((Lookup, Effect::StartLookup))
                            }
                        }
                    }
                    (Lookup, Connecting) => match shared.remote {
                        Some(addr) => {
                            shared.state = Connecting;
                            Some((Connecting, Effect::StartConnect(addr)))
                        }
                        // a second connect request racing the lookup; the
                        // lookup in flight already serves it
                        None => {
                            log::debug!("Ignoring connect request while lookup is in flight");
                            None
                        }
                    },
                    // lookup and connect can only be abandoned, there is no
                    // transport to close yet
                    (Lookup, Closed) | (Lookup, Closing) => {
                        shared.state = Closed;
                        Some((Closed, Effect::None))
                    }
                    (Connecting, Closed) | (Connecting, Closing) => {
                        shared.state = Closed;
                        Some((Closed, Effect::None))
                    }
                    (Connecting, Connected) => {
                        shared.state = Connected;
                        Some((Connected, Effect::Established))
                    }
                    (Connected, Bound) => {
                        shared.state = Bound;
                        Some((Bound, Effect::BoundHook))
                    }
                    (Connected, Closing) | (Bound, Closing) => {
                        shared.state = Closing;
                        shared.closing_error = error.clone();
                        Some((Closing, Effect::BeginClose(shared.channel.clone())))
                    }
                    (Closing, Closed) => {
                        shared.state = Closed;
                        shared.session = None;
                        Some((Closed, Effect::Finalize(shared.channel.take())))
                    }
                    (from, to) => {
                        log::warn!(
                            "Ignoring invalid transition request {} -> {}",
                            from.as_str(),
                            to.as_str()
                        );
                        None
                    }
                }
            };

            decision.map(|(new_state, effect)| {
                // the Closed transition reports the cause recorded when
                // closing began
                let error = if new_state == Closed && error.is_none() {
                    shared.closing_error.take()
                } else {
                    error
                };
                shared.notifications.push_back((new_state, error.clone()));
                (effect, error)
            })
        };

        let Some((effect, error)) = prepared else {
            return;
        };

        self.flush_notifications();
        self.apply(effect, error);
    }

    /// Deliver queued transitions in order, callbacks outside the lock
    ///
    /// Only one thread drains at a time; a thread that finds the queue busy
    /// leaves its entry for the draining thread, so observers never see
    /// transitions out of decision order.
    fn flush_notifications(&self) {
        loop {
            let (state, error) = {
                let mut shared = self.shared.lock().unwrap();
                if shared.notifying {
                    return;
                }
                match shared.notifications.pop_front() {
                    Some(item) => {
                        shared.notifying = true;
                        item
                    }
                    None => return,
                }
            };

            match &error {
                Some(e) => log::info!(
                    "Connection {} -> {}: {}",
                    self.address,
                    state.as_str(),
                    e
                ),
                None => log::info!("Connection {} -> {}", self.address, state.as_str()),
            }
            self.state_tx.send_replace(state);
            self.notify_listeners(state, error.as_deref());

            self.shared.lock().unwrap().notifying = false;
        }
    }

    fn notify_listeners(&self, state: ConnectionState, error: Option<&LinkError>) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.state_changed(state, error)));
            if result.is_err() {
                log::warn!("State listener panicked; continuing with the others");
            }
        }
    }

    fn apply(&self, effect: Effect, error: Option<Arc<LinkError>>) {
        match effect {
            Effect::None => {}
            Effect::StartLookup => {
                let Some(connection) = self.self_ref.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let result = match tokio::net::lookup_host(connection.address.as_str()).await {
                        Ok(mut addrs) => match addrs.next() {
                            Some(addr) => Ok(addr),
                            None => Err(LinkError::Lookup(format!(
                                "No addresses for {}",
                                connection.address
                            ))),
                        },
                        Err(e) => Err(LinkError::Lookup(e.to_string())),
                    };
                    connection.lookup_complete(result);
                });
            }
            Effect::StartConnect(addr) => {
                let Some(connection) = self.self_ref.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let (events_tx, events_rx) = mpsc::channel(64);
                    match connection.connector.connect(addr, events_tx).await {
                        Ok(channel) => connection.transport_connected(channel, events_rx),
                        Err(e) => connection.connect_failed(e),
                    }
                });
            }
            Effect::Established => {
                if let (Some(handler), Some(connection)) =
                    (self.current_handler(), self.self_ref.upgrade())
                {
                    handler.on_connection_established(&connection);
                }
            }
            Effect::BoundHook => {
                if let (Some(handler), Some(connection)) =
                    (self.current_handler(), self.self_ref.upgrade())
                {
                    handler.on_connection_bound(&connection);
                }
            }
            Effect::BeginClose(channel) => {
                // no new sequence may expect a reply from here on
                self.messenger.disconnected();
                match channel {
                    Some(channel) => {
                        // the transport reports SessionClosed once the close
                        // completes, which finalizes the state machine
                        tokio::spawn(async move { channel.close().await });
                    }
                    None => self.switch_state(ConnectionState::Closed, error),
                }
            }
            Effect::Finalize(channel) => {
                self.messenger.disconnected();
                if let Some(channel) = channel {
                    // disposal happens off the state machine so a slow
                    // teardown never blocks transitions
                    tokio::spawn(async move { channel.close().await });
                }
            }
        }
    }

    fn current_handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn lookup_complete(&self, result: Result<SocketAddr, LinkError>) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.state != ConnectionState::Lookup {
                log::debug!(
                    "Stale lookup result discarded in state {}",
                    shared.state.as_str()
                );
                return;
            }
            if let Ok(addr) = &result {
                shared.remote = Some(*addr);
            }
        }
        match result {
            Ok(_) => self.switch_state(ConnectionState::Connecting, None),
            Err(e) => self.switch_state(ConnectionState::Closed, Some(Arc::new(e))),
        }
    }

    fn connect_failed(&self, error: LinkError) {
        {
            let shared = self.shared.lock().unwrap();
            if shared.state != ConnectionState::Connecting {
                log::debug!(
                    "Stale connect failure discarded in state {}",
                    shared.state.as_str()
                );
                return;
            }
        }
        self.switch_state(ConnectionState::Closed, Some(Arc::new(error)));
    }

    fn transport_connected(
        &self,
        channel: Arc<dyn MessageChannel>,
        events: mpsc::Receiver<TransportEvent>,
    ) {
        let stale = {
            let mut shared = self.shared.lock().unwrap();
            if shared.state != ConnectionState::Connecting {
                true
            } else {
                shared.channel = Some(channel.clone());
                false
            }
        };
        if stale {
            // disconnected while the connect was in flight
            log::debug!("Discarding channel established after abort");
            tokio::spawn(async move { channel.close().await });
            return;
        }

        self.messenger.connected(channel);
        if let Some(connection) = self.self_ref.upgrade() {
            tokio::spawn(connection.run_event_pump(events));
        }
        self.switch_state(ConnectionState::Connected, None);
    }

    async fn run_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::SessionOpened => {
                    log::debug!("Transport session to {} opened", self.address);
                }
                TransportEvent::MessageReceived(message) => {
                    if let Err(e) = self.messenger.message_received(message).await {
                        log::warn!("Failed to dispatch received message: {}", e);
                    }
                }
                TransportEvent::SessionIdle => {
                    self.keepalive.ping(&self.messenger).await;
                }
                TransportEvent::ExceptionCaught(e) => {
                    log::warn!("Transport error on {}: {}", self.address, e);
                }
                TransportEvent::SessionClosed => {
                    self.session_closed();
                    break;
                }
            }
        }
    }

    /// Transport-side closure, expected (after Closing) or abrupt
    fn session_closed(&self) {
        let state = self.state();
        if matches!(state, ConnectionState::Connected | ConnectionState::Bound) {
            self.switch_state(
                ConnectionState::Closing,
                Some(Arc::new(LinkError::Disconnected(
                    "session closed by transport".to_string(),
                ))),
            );
        }
        self.switch_state(ConnectionState::Closed, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingStateListener {
        events: Mutex<Vec<(ConnectionState, Option<String>)>>,
    }

    impl RecordingStateListener {
        fn arc() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<(ConnectionState, Option<String>)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ConnectionStateListener for RecordingStateListener {
        fn state_changed(&self, state: ConnectionState, error: Option<&LinkError>) {
            self.events
                .lock()
                .unwrap()
                .push((state, error.map(|e| e.to_string())));
        }
    }

    async fn wait_for_state(connection: &Arc<Connection>, expected: ConnectionState) {
        let mut rx = connection.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .unwrap_or_else(|_| panic!("never reached {}", expected.as_str()))
            .expect("state channel closed");
    }

    fn connection(connector: &Arc<MockConnector>) -> Arc<Connection> {
        let connector: Arc<dyn Connector> = connector.clone();
        Connection::new("127.0.0.1:4059", ConnectionOptions::default(), connector)
    }

    #[tokio::test]
    async fn test_connect_walks_lookup_connecting_connected() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let listener = RecordingStateListener::arc();
        conn.add_state_listener(listener.clone());

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;

        let states: Vec<_> = listener.events().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Lookup,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_skips_lookup_with_cached_address() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        conn.disconnect();
        connector.push_event(TransportEvent::SessionClosed).await;
        wait_for_state(&conn, ConnectionState::Closed).await;

        let listener = RecordingStateListener::arc();
        conn.add_state_listener(listener.clone());
        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;

        let states: Vec<_> = listener.events().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_closed_with_cause() {
        let connector = MockConnector::arc();
        connector.fail_connects(true);
        let conn = connection(&connector);
        let listener = RecordingStateListener::arc();
        conn.add_state_listener(listener.clone());

        conn.connect();
        wait_for_state(&conn, ConnectionState::Closed).await;

        let events = listener.events();
        let (state, error) = events.last().unwrap();
        assert_eq!(*state, ConnectionState::Closed);
        assert!(error.as_ref().unwrap().contains("mock connect refused"));
        // no retry happens inside the state machine
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_surfaces_closed_with_cause() {
        let connector = MockConnector::arc();
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        // missing port makes address resolution fail without touching DNS
        let conn = Connection::new("localhost", ConnectionOptions::default(), dyn_connector);
        let listener = RecordingStateListener::arc();
        conn.add_state_listener(listener.clone());

        conn.connect();
        wait_for_state(&conn, ConnectionState::Closed).await;

        let events = listener.events();
        assert_eq!(events[0].0, ConnectionState::Lookup);
        let (state, error) = events.last().unwrap();
        assert_eq!(*state, ConnectionState::Closed);
        assert!(error.is_some());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_in_flight() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);

        conn.connect();
        conn.connect();
        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_request_during_lookup_is_ignored() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);

        // two connect requests race: the first starts the lookup, the second
        // arrives before it resolves (the spawned lookup has not run yet on
        // the current-thread runtime)
        conn.switch_state(ConnectionState::Connecting, None);
        assert_eq!(conn.state(), ConnectionState::Lookup);
        conn.switch_state(ConnectionState::Connecting, None);
        assert_eq!(conn.state(), ConnectionState::Lookup);

        wait_for_state(&conn, ConnectionState::Connected).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_listener_initiated_disconnect_preserves_delivery_order() {
        struct DisconnectOnConnected {
            connection: Mutex<Option<Arc<Connection>>>,
            seen: Mutex<Vec<ConnectionState>>,
        }
        impl ConnectionStateListener for DisconnectOnConnected {
            fn state_changed(&self, state: ConnectionState, _error: Option<&LinkError>) {
                self.seen.lock().unwrap().push(state);
                if state == ConnectionState::Connected {
                    if let Some(conn) = self.connection.lock().unwrap().take() {
                        conn.disconnect();
                    }
                }
            }
        }

        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let listener = Arc::new(DisconnectOnConnected {
            connection: Mutex::new(Some(conn.clone())),
            seen: Mutex::new(Vec::new()),
        });
        conn.add_state_listener(listener.clone());

        conn.connect();
        wait_for_state(&conn, ConnectionState::Closing).await;
        connector.push_event(TransportEvent::SessionClosed).await;
        wait_for_state(&conn, ConnectionState::Closed).await;

        // the disconnect issued from inside the Connected callback must not
        // let a later transition overtake an earlier one
        let seen = listener.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Lookup,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closing,
                ConnectionState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_session_inactivity_with_silent_peer_reaches_closed() {
        use scadalink_transport::{TcpConnector, TcpConnectorSettings};
        use std::collections::HashMap;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // hold the socket open without ever sending a byte
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let options = ConnectionOptions::from_properties(HashMap::from([(
            "timeout".to_string(),
            "1000".to_string(),
        )]));
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(
            TcpConnectorSettings::new(options.connect_timeout(), options.ping_period()),
        ));
        let conn = Connection::new(addr.to_string(), options, connector);

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        // unanswered keepalive pings must not defer the teardown, and the
        // local close must finalize the state machine despite the hung peer
        wait_for_state(&conn, ConnectionState::Closed).await;
        assert!(!conn.messenger().is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn test_undeclared_transition_is_a_noop() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let listener = RecordingStateListener::arc();
        conn.add_state_listener(listener.clone());

        // already Closed: requesting Closing is not a declared transition
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_closed_cannot_jump_to_bound() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);
        conn.request_bound();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_graceful_disconnect_times_out_pending_requests() {
        use crate::testing::RecordingListener;
        use scadalink_core::Message;

        let connector = MockConnector::arc();
        let conn = connection(&connector);
        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;

        let reply_listener = RecordingListener::arc();
        conn.messenger()
            .send_request(Message::new(0x0200), reply_listener.clone(), Duration::ZERO)
            .await;

        conn.disconnect();
        connector.push_event(TransportEvent::SessionClosed).await;
        wait_for_state(&conn, ConnectionState::Closed).await;

        assert_eq!(reply_listener.timeouts(), 1);
        assert_eq!(reply_listener.replies(), 0);
    }

    #[tokio::test]
    async fn test_abrupt_transport_close_routes_through_closing() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let listener = RecordingStateListener::arc();
        conn.add_state_listener(listener.clone());

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        connector.push_event(TransportEvent::SessionClosed).await;
        wait_for_state(&conn, ConnectionState::Closed).await;

        let states: Vec<_> = listener.events().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Lookup,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closing,
                ConnectionState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_break_delivery() {
        struct Panicking;
        impl ConnectionStateListener for Panicking {
            fn state_changed(&self, _state: ConnectionState, _error: Option<&LinkError>) {
                panic!("listener bug");
            }
        }

        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let witness = RecordingStateListener::arc();
        conn.add_state_listener(Arc::new(Panicking));
        conn.add_state_listener(witness.clone());

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        assert!(!witness.events().is_empty());
    }

    #[tokio::test]
    async fn test_remove_state_listener() {
        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let listener = RecordingStateListener::arc();
        let registered: Arc<dyn ConnectionStateListener> = listener.clone();
        conn.add_state_listener(registered.clone());
        conn.remove_state_listener(&registered);

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_session_idle_triggers_keepalive_ping() {
        use scadalink_core::codes;

        let connector = MockConnector::arc();
        let conn = connection(&connector);
        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;

        connector.push_event(TransportEvent::SessionIdle).await;
        let ping = connector
            .channel
            .wait_for_sent(|m| m.command_code() == codes::PING)
            .await;
        assert!(ping.is_unsolicited());
    }

    #[tokio::test]
    async fn test_established_hook_runs_on_connected() {
        struct CountingHandler {
            established: AtomicUsize,
            bound: AtomicUsize,
        }
        impl ConnectionHandler for CountingHandler {
            fn on_connection_established(&self, _connection: &Arc<Connection>) {
                self.established.fetch_add(1, Ordering::SeqCst);
            }
            fn on_connection_bound(&self, _connection: &Arc<Connection>) {
                self.bound.fetch_add(1, Ordering::SeqCst);
            }
        }

        let connector = MockConnector::arc();
        let conn = connection(&connector);
        let handler = Arc::new(CountingHandler {
            established: AtomicUsize::new(0),
            bound: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&handler);
        conn.set_handler(weak);

        conn.connect();
        wait_for_state(&conn, ConnectionState::Connected).await;
        assert_eq!(handler.established.load(Ordering::SeqCst), 1);
        assert_eq!(handler.bound.load(Ordering::SeqCst), 0);

        conn.request_bound();
        wait_for_state(&conn, ConnectionState::Bound).await;
        assert_eq!(handler.bound.load(Ordering::SeqCst), 1);
    }
}
