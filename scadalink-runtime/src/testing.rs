//! In-memory transport doubles shared by the unit tests

use crate::messenger::ReplyListener;
use async_trait::async_trait;
use scadalink_core::{LinkError, LinkResult, Message};
use scadalink_transport::{Connector, MessageChannel, TransportEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Message channel that records outgoing messages instead of sending them
#[derive(Debug, Default)]
pub struct MockChannel {
    sequence: AtomicU64,
    sent: Mutex<Vec<Message>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockChannel {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Drain and return everything sent so far
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Wait until the channel was asked to close
    pub async fn wait_for_closed(&self) {
        for _ in 0..2000 {
            if self.is_closed() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("channel was never closed");
    }

    /// Wait until a sent message satisfies the predicate, then return it
    pub async fn wait_for_sent<F>(&self, predicate: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        for _ in 0..2000 {
            {
                let mut sent = self.sent.lock().unwrap();
                if let Some(pos) = sent.iter().position(&predicate) {
                    return sent.remove(pos);
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("expected message was never sent");
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send(&self, message: Message) -> LinkResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Reply listener that counts terminal callbacks
#[derive(Default)]
pub struct RecordingListener {
    replies: Mutex<Vec<Message>>,
    timeouts: AtomicUsize,
}

impl RecordingListener {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn last_reply_sequence(&self) -> Option<u64> {
        self.replies
            .lock()
            .unwrap()
            .last()
            .map(Message::reply_sequence)
    }
}

impl ReplyListener for RecordingListener {
    fn reply(&self, message: Message) {
        self.replies.lock().unwrap().push(message);
    }

    fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out a shared [`MockChannel`] and exposing the event
/// sender so tests can play the transport side
pub struct MockConnector {
    pub channel: Arc<MockChannel>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    fail_connects: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self {
            channel: MockChannel::arc(),
            events: Mutex::new(None),
            fail_connects: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push a transport event into the connection's event pump
    pub async fn push_event(&self, event: TransportEvent) {
        let sender = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("not connected yet");
        sender.send(event).await.expect("event pump gone");
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _address: SocketAddr,
        events: mpsc::Sender<TransportEvent>,
    ) -> LinkResult<Arc<dyn MessageChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(LinkError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connect refused",
            )));
        }
        let _ = events.send(TransportEvent::SessionOpened).await;
        *self.events.lock().unwrap() = Some(events);
        Ok(self.channel.clone())
    }
}
