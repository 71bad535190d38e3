//! Keepalive supervision
//!
//! Pure policy: when the transport reports a read-idle period, a PING
//! request is pushed through the messenger. The ping needs no meaningful
//! reply handling; its purpose is keeping the session-inactivity clock
//! advancing on both peers. The idle period itself is configured into the
//! transport from [`KeepAlive::period`].

use crate::messenger::{Messenger, ReplyListener};
use scadalink_core::{codes, ConnectionOptions, Message};
use std::sync::Arc;
use std::time::Duration;

/// Keepalive policy derived from the connection options
#[derive(Debug, Clone)]
pub struct KeepAlive {
    period: Duration,
}

impl KeepAlive {
    /// Derive the ping period: explicit `pingPeriod`, falling back to
    /// `timeout / pingFrequency`
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            period: options.ping_period(),
        }
    }

    /// The read-idle period after which a ping is due
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Send one ping; called on the transport's read-idle event
    pub async fn ping(&self, messenger: &Arc<Messenger>) {
        log::debug!("Session idle, sending ping");
        messenger
            .send_request(Message::new(codes::PING), Arc::new(PingListener), self.period)
            .await;
    }
}

/// Ping outcomes only matter for the inactivity clock, so both are just
/// logged
struct PingListener;

impl ReplyListener for PingListener {
    fn reply(&self, _message: Message) {
        log::trace!("Ping answered");
    }

    fn timed_out(&self) {
        log::debug!("Ping not answered; session timeout supervision will decide");
    }
}
