//! Message correlation and timeout engine
//!
//! The messenger turns a half-duplex stream of messages into matched
//! request/reply pairs plus a push-handler dispatch table. Every outstanding
//! request is tracked by its sequence number; a periodic sweep enforces
//! per-request timeouts and the session-level inactivity limit.
//!
//! # Locking
//!
//! One mutex guards the pending-request table, the handler table, the
//! installed channel, and the activity clock. Listener and handler callbacks
//! are always invoked after the guard is dropped, so a callback may call back
//! into the messenger (for example to send a follow-up request) without
//! deadlocking. A pending request receives at most one terminal callback
//! (`reply` xor `timed_out`): the table entry is removed under the lock
//! before either is invoked.

use scadalink_core::{codes, fields, LinkError, LinkResult, Message, Value};
use scadalink_transport::MessageChannel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Interval of the timeout sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal callbacks for one outstanding request
///
/// Exactly one of the two methods is invoked, exactly once.
pub trait ReplyListener: Send + Sync {
    /// The matching reply arrived
    fn reply(&self, message: Message);

    /// The request timed out, was canceled, or the connection went away
    fn timed_out(&self);
}

/// Handler for unsolicited (server-initiated) messages of one command code
///
/// A returned error is reported back to the peer as a FAILED reply; it never
/// tears down the connection.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: &Message) -> LinkResult<()>;
}

/// Bookkeeping for one outstanding request
struct Pending {
    listener: Arc<dyn ReplyListener>,
    created: Instant,
    /// Zero means "session-level timeout only"
    timeout: Duration,
    canceled: bool,
}

impl Pending {
    fn expired(&self, now: Instant) -> bool {
        self.canceled
            || (self.timeout > Duration::ZERO
                && now.duration_since(self.created) >= self.timeout)
    }
}

struct Inner {
    channel: Option<Arc<dyn MessageChannel>>,
    pending: HashMap<u64, Pending>,
    handlers: HashMap<u32, Arc<dyn MessageHandler>>,
    /// Time of the last received message. Only inbound traffic defers the
    /// inactivity teardown: sends always succeed against a hung peer, so
    /// counting them would keep a dead session alive forever.
    last_activity: Instant,
    sweeper: Option<JoinHandle<()>>,
}

/// What to do with a received message, decided under the lock and executed
/// after it is released
enum Dispatch {
    Deliver(Arc<dyn ReplyListener>),
    DropCanceled(Arc<dyn ReplyListener>),
    Acknowledged,
    Failed,
    UnknownByPeer,
    Push(Arc<dyn MessageHandler>, Option<Arc<dyn MessageChannel>>),
    Unroutable(Option<Arc<dyn MessageChannel>>),
}

/// The message correlation engine
pub struct Messenger {
    /// Handle to our own Arc, handed to the sweeper task
    self_ref: Weak<Messenger>,
    session_timeout: Duration,
    inner: Mutex<Inner>,
}

impl Messenger {
    /// Create a messenger with the given session-level inactivity timeout
    pub fn new(session_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            session_timeout,
            inner: Mutex::new(Inner {
                channel: None,
                pending: HashMap::new(),
                handlers: HashMap::new(),
                last_activity: Instant::now(),
                sweeper: None,
            }),
        })
    }

    /// True while a channel is installed
    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().channel.is_some()
    }

    /// Install a freshly connected channel and start the timeout sweep
    ///
    /// Defensively tears down any previous session first, so a stale channel
    /// can never leak pending requests into the new one.
    pub fn connected(&self, channel: Arc<dyn MessageChannel>) {
        self.disconnected();

        let sweeper = tokio::spawn(run_sweeper(self.self_ref.clone()));

        let mut inner = self.inner.lock().unwrap();
        inner.channel = Some(channel);
        inner.last_activity = Instant::now();
        inner.sweeper = Some(sweeper);
    }

    /// Tear down the session: stop the sweep, drain the pending table, and
    /// time out every drained request
    ///
    /// Idempotent, and safe to invoke redundantly from the explicit
    /// disconnect path, the transport-closed event, and the session-timeout
    /// sweep: the table is drained exactly once, so no request can be
    /// double-fired.
    pub fn disconnected(&self) {
        let (sweeper, drained) = {
            let mut inner = self.inner.lock().unwrap();
            inner.channel = None;
            let sweeper = inner.sweeper.take();
            let drained: Vec<Pending> = inner.pending.drain().map(|(_, p)| p).collect();
            (sweeper, drained)
        };

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        if !drained.is_empty() {
            log::debug!("Disconnect drained {} pending requests", drained.len());
        }
        for pending in drained {
            pending.listener.timed_out();
        }
    }

    /// Send a request and track its reply
    ///
    /// The channel assigns the sequence number; the pending entry is
    /// registered under the lock before the bytes leave, so a fast reply can
    /// never miss it. A `timeout` of zero means the request is bounded only
    /// by the session-level timeout.
    ///
    /// Returns the assigned sequence (usable with [`Messenger::cancel`]), or
    /// 0 when nothing was sent — in that case `listener.timed_out()` has
    /// already been invoked.
    pub async fn send_request(
        &self,
        mut message: Message,
        listener: Arc<dyn ReplyListener>,
        timeout: Duration,
    ) -> u64 {
        let sent = {
            let mut inner = self.inner.lock().unwrap();
            match inner.channel.clone() {
                Some(channel) => {
                    let sequence = channel.next_sequence();
                    message.set_sequence(sequence);
                    inner.pending.insert(
                        sequence,
                        Pending {
                            listener: listener.clone(),
                            created: Instant::now(),
                            timeout,
                            canceled: false,
                        },
                    );
                    Some((channel, sequence))
                }
                None => None,
            }
        };

        let Some((channel, sequence)) = sent else {
            log::debug!("Request {} dropped: not connected", message);
            listener.timed_out();
            return 0;
        };

        if let Err(e) = channel.send(message).await {
            log::warn!("Failed to send request {}: {}", sequence, e);
            let removed = self.inner.lock().unwrap().pending.remove(&sequence);
            if let Some(pending) = removed {
                pending.listener.timed_out();
            }
            return 0;
        }
        sequence
    }

    /// Send a message without tracking a reply
    pub async fn send_message(&self, mut message: Message) -> LinkResult<()> {
        let channel = {
            let inner = self.inner.lock().unwrap();
            let channel = inner.channel.clone();
            if let Some(channel) = &channel {
                message.set_sequence(channel.next_sequence());
            }
            channel
        };
        match channel {
            Some(channel) => channel.send(message).await,
            None => Err(LinkError::NotConnected),
        }
    }

    /// Send a request and await its reply
    ///
    /// Convenience wrapper over [`Messenger::send_request`] for callers that
    /// want to block their own task; the engine itself stays asynchronous.
    pub async fn request(&self, message: Message, timeout: Duration) -> LinkResult<Message> {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(OneshotListener {
            tx: Mutex::new(Some(tx)),
        });
        self.send_request(message, listener, timeout).await;
        match rx.await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Register the push handler for unsolicited messages of one command code
    ///
    /// Handler registrations survive disconnects; they never expire on their
    /// own.
    pub fn register_handler(&self, command_code: u32, handler: Arc<dyn MessageHandler>) {
        let previous = self
            .inner
            .lock()
            .unwrap()
            .handlers
            .insert(command_code, handler);
        if previous.is_some() {
            log::warn!("Replaced push handler for command 0x{:04X}", command_code);
        }
    }

    /// Remove the push handler for one command code
    pub fn unregister_handler(&self, command_code: u32) {
        self.inner.lock().unwrap().handlers.remove(&command_code);
    }

    /// Mark an outstanding request as canceled
    ///
    /// The request is subsequently treated identically to a timeout: the
    /// next sweep fires `timed_out`, and a reply that still arrives is
    /// logged and dropped, never delivered.
    pub fn cancel(&self, sequence: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending.get_mut(&sequence) {
            pending.canceled = true;
            log::debug!("Canceled pending request {}", sequence);
        }
    }

    /// Dispatch one received message
    ///
    /// Routing order: matching pending request first, then the built-in
    /// administrative codes, then registered push handlers; anything left is
    /// answered with UNKNOWN_COMMAND.
    pub async fn message_received(&self, message: Message) -> LinkResult<()> {
        let dispatch = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_activity = Instant::now();

            let reply_sequence = message.reply_sequence();
            if reply_sequence != 0 {
                if let Some(pending) = inner.pending.remove(&reply_sequence) {
                    if pending.canceled {
                        Dispatch::DropCanceled(pending.listener)
                    } else {
                        Dispatch::Deliver(pending.listener)
                    }
                } else {
                    // reply for a request we no longer track (already timed
                    // out or drained); falls through to the admin/handler
                    // routing below
                    Self::route_unsolicited(&inner, &message)
                }
            } else {
                Self::route_unsolicited(&inner, &message)
            }
        };

        match dispatch {
            Dispatch::Deliver(listener) => {
                listener.reply(message);
                Ok(())
            }
            Dispatch::DropCanceled(listener) => {
                log::info!("Dropped reply for canceled request: {}", message);
                listener.timed_out();
                Ok(())
            }
            Dispatch::Acknowledged => Ok(()),
            Dispatch::Failed => {
                log::warn!(
                    "Peer reported failure: {}",
                    message.error_info().unwrap_or("no detail")
                );
                Ok(())
            }
            Dispatch::UnknownByPeer => {
                log::warn!("Peer did not recognize our command: {}", message);
                Ok(())
            }
            Dispatch::Push(handler, channel) => {
                if let Err(e) = handler.handle_message(&message) {
                    log::warn!(
                        "Push handler for command 0x{:04X} failed: {}",
                        message.command_code(),
                        e
                    );
                    let failed = Message::reply_to(&message, codes::FAILED)
                        .with_field(fields::ERROR_INFO, Value::String(e.to_string()));
                    Self::send_reply(channel, failed).await;
                }
                Ok(())
            }
            Dispatch::Unroutable(channel) => {
                log::warn!("No handler for received message: {}", message);
                let unknown = Message::reply_to(&message, codes::UNKNOWN_COMMAND);
                Self::send_reply(channel, unknown).await;
                Ok(())
            }
        }
    }

    fn route_unsolicited(inner: &Inner, message: &Message) -> Dispatch {
        match message.command_code() {
            codes::ACK => Dispatch::Acknowledged,
            codes::FAILED => Dispatch::Failed,
            codes::UNKNOWN_COMMAND => Dispatch::UnknownByPeer,
            command_code => match inner.handlers.get(&command_code) {
                Some(handler) => Dispatch::Push(handler.clone(), inner.channel.clone()),
                None => Dispatch::Unroutable(inner.channel.clone()),
            },
        }
    }

    async fn send_reply(channel: Option<Arc<dyn MessageChannel>>, mut reply: Message) {
        let Some(channel) = channel else {
            log::debug!("Dropped outgoing reply {}: not connected", reply);
            return;
        };
        reply.set_sequence(channel.next_sequence());
        if let Err(e) = channel.send(reply).await {
            log::warn!("Failed to send administrative reply: {}", e);
        }
    }

    /// One pass of the timeout sweep; returns true when the session was torn
    /// down for inactivity and the sweep loop should end
    async fn sweep(&self) -> bool {
        let now = Instant::now();
        let (expired, session_teardown) = {
            let mut inner = self.inner.lock().unwrap();

            let keys: Vec<u64> = inner
                .pending
                .iter()
                .filter(|(_, p)| p.expired(now))
                .map(|(k, _)| *k)
                .collect();
            let mut expired: Vec<Pending> = keys
                .iter()
                .filter_map(|k| inner.pending.remove(k))
                .collect();

            let idle = now.duration_since(inner.last_activity);
            let teardown = if inner.channel.is_some() && idle >= self.session_timeout {
                let channel = inner.channel.take();
                expired.extend(inner.pending.drain().map(|(_, p)| p));
                // the sweeper handle is this very task; ending the loop
                // below is its shutdown
                inner.sweeper = None;
                channel
            } else {
                None
            };
            (expired, teardown)
        };

        for pending in &expired {
            pending.listener.timed_out();
        }

        if let Some(channel) = session_teardown {
            log::warn!(
                "No traffic for {:?}, closing session ({} requests timed out)",
                self.session_timeout,
                expired.len()
            );
            channel.close().await;
            return true;
        }
        false
    }
}

async fn run_sweeper(messenger: Weak<Messenger>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let Some(messenger) = messenger.upgrade() else {
            return;
        };
        if messenger.sweep().await {
            return;
        }
    }
}

struct OneshotListener {
    tx: Mutex<Option<oneshot::Sender<Option<Message>>>>,
}

impl ReplyListener for OneshotListener {
    fn reply(&self, message: Message) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Some(message));
        }
    }

    fn timed_out(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(None);
        }
    }
}
