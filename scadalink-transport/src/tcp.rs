//! TCP transport implementation
//!
//! One [`TcpChannel`] wraps the write half of a connected stream; a spawned
//! reader task owns the read half, decodes frames, and pushes
//! [`TransportEvent`]s to the runtime until the session ends. Read-idle
//! detection is implemented here so the runtime only sees the abstract
//! `SessionIdle` event.

use crate::channel::{Connector, MessageChannel, TransportEvent};
use crate::codec::{decode_payload, encode_frame, MAX_FRAME_LENGTH};
use async_trait::async_trait;
use scadalink_core::{LinkError, LinkResult, Message};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};

/// TCP connector settings
#[derive(Debug, Clone)]
pub struct TcpConnectorSettings {
    /// Timeout for establishing the socket connection
    pub connect_timeout: Option<Duration>,
    /// Read-idle period after which `SessionIdle` is emitted
    pub idle_period: Option<Duration>,
}

impl TcpConnectorSettings {
    /// Create settings with the given timeouts
    pub fn new(connect_timeout: Duration, idle_period: Duration) -> Self {
        Self {
            connect_timeout: Some(connect_timeout),
            idle_period: Some(idle_period),
        }
    }
}

impl Default for TcpConnectorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
            idle_period: None,
        }
    }
}

/// Connector producing TCP message channels
#[derive(Debug, Clone)]
pub struct TcpConnector {
    settings: TcpConnectorSettings,
}

impl TcpConnector {
    /// Create a new TCP connector
    pub fn new(settings: TcpConnectorSettings) -> Self {
        Self { settings }
    }
}

/// Send side of one TCP session
pub struct TcpChannel {
    writer: Mutex<Option<OwnedWriteHalf>>,
    sequence: AtomicU64,
    peer: SocketAddr,
    /// Wakes the reader task on a local close, since a hung peer would
    /// otherwise keep it waiting forever
    shutdown: Arc<Notify>,
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel").field("peer", &self.peer).finish()
    }
}

#[async_trait]
impl MessageChannel for TcpChannel {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send(&self, message: Message) -> LinkResult<()> {
        let frame = encode_frame(&message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NotConnected)?;
        if let Err(e) = writer.write_all(&frame).await {
            // a failed write leaves the stream unusable
            *guard = None;
            return Err(LinkError::Connection(e));
        }
        writer.flush().await.map_err(LinkError::Connection)
    }

    async fn close(&self) {
        {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }
        // the reader observes this even when the peer never answers the
        // shutdown, and emits SessionClosed
        self.shutdown.notify_one();
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: SocketAddr,
        events: mpsc::Sender<TransportEvent>,
    ) -> LinkResult<Arc<dyn MessageChannel>> {
        let stream = if let Some(timeout) = self.settings.connect_timeout {
            tokio::time::timeout(timeout, TcpStream::connect(address))
                .await
                .map_err(|_| LinkError::Timeout)?
                .map_err(LinkError::Connection)?
        } else {
            TcpStream::connect(address)
                .await
                .map_err(LinkError::Connection)?
        };

        let (read_half, write_half) = stream.into_split();
        let shutdown = Arc::new(Notify::new());
        let channel = Arc::new(TcpChannel {
            writer: Mutex::new(Some(write_half)),
            sequence: AtomicU64::new(0),
            peer: address,
            shutdown: shutdown.clone(),
        });

        let _ = events.send(TransportEvent::SessionOpened).await;
        tokio::spawn(read_loop(
            read_half,
            events,
            self.settings.idle_period,
            address,
            shutdown,
        ));
        Ok(channel)
    }
}

/// Read one frame, `Ok(None)` on clean EOF at a frame boundary
async fn read_frame(reader: &mut OwnedReadHalf) -> LinkResult<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(LinkError::Connection(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(LinkError::InvalidData(format!(
            "Frame payload too large: {} bytes",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(LinkError::Connection)?;
    decode_payload(&payload).map(Some)
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    idle_period: Option<Duration>,
    peer: SocketAddr,
    shutdown: Arc<Notify>,
) {
    loop {
        // None marks an elapsed idle period without a frame
        let read = async {
            if let Some(idle) = idle_period {
                match tokio::time::timeout(idle, read_frame(&mut reader)).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            } else {
                Some(read_frame(&mut reader).await)
            }
        };

        let outcome = tokio::select! {
            _ = shutdown.notified() => {
                log::debug!("TCP session to {} closed locally", peer);
                let _ = events.send(TransportEvent::SessionClosed).await;
                return;
            }
            outcome = read => outcome,
        };

        match outcome {
            None => {
                if events.send(TransportEvent::SessionIdle).await.is_err() {
                    return;
                }
            }
            Some(Ok(Some(message))) => {
                if events
                    .send(TransportEvent::MessageReceived(message))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(None)) => {
                log::debug!("TCP session to {} closed by peer", peer);
                let _ = events.send(TransportEvent::SessionClosed).await;
                return;
            }
            Some(Err(e)) => {
                log::warn!("TCP session to {} failed: {}", peer, e);
                let _ = events.send(TransportEvent::ExceptionCaught(e)).await;
                let _ = events.send(TransportEvent::SessionClosed).await;
                return;
            }
        }
    }
}
