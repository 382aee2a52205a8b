//! UDP command channel backed by a tokio socket.
//!
//! ```text
//! UdpTransport::open(port) ──► UdpCommandChannel ── send("command") ──► device:8889
//!                              └─ listener task  ◄── "ok" / ICMP error
//!                                   └─ mpsc<ChannelEvent>
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tellolink_core::TransportError;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ChannelEvent, CommandChannel, CommandTransport};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Device replies are short status strings; anything longer is truncated.
const MAX_REPLY_BYTES: usize = 2_048;
const EVENT_CAPACITY: usize = 64;

// ── UdpTransport ──────────────────────────────────────────────────────────────

/// Opens [`UdpCommandChannel`]s on `0.0.0.0:<local_port>`.
#[derive(Debug, Clone, Default)]
pub struct UdpTransport;

#[async_trait]
impl CommandTransport for UdpTransport {
    async fn open(
        &self,
        local_port: u16,
    ) -> Result<(Box<dyn CommandChannel>, mpsc::Receiver<ChannelEvent>), TransportError> {
        let (channel, events) = UdpCommandChannel::bind(local_port).await?;
        Ok((Box::new(channel), events))
    }
}

// ── UdpCommandChannel ─────────────────────────────────────────────────────────

pub struct UdpCommandChannel {
    socket: Option<Arc<UdpSocket>>,
    listener: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl UdpCommandChannel {
    /// Bind to `local_port` on all interfaces and start the reply listener.
    pub async fn bind(local_port: u16) -> Result<(Self, mpsc::Receiver<ChannelEvent>), TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(|source| TransportError::Bind { port: local_port, source })?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().ok();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let listener = tokio::spawn(listen(Arc::clone(&socket), event_tx));

        info!("Command channel bound on {:?}", local_addr);
        Ok((
            Self {
                socket: Some(socket),
                listener: Some(listener),
                local_addr,
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl CommandChannel for UdpCommandChannel {
    async fn send(&self, command: &str, remote: SocketAddr) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::ChannelClosed)?;
        let sent = socket
            .send_to(command.as_bytes(), remote)
            .await
            .map_err(|e| TransportError::SendFailed {
                command: command.to_owned(),
                reason: e.to_string(),
            })?;
        if sent != command.len() {
            return Err(TransportError::SendFailed {
                command: command.to_owned(),
                reason: format!("short write ({sent} of {} bytes)", command.len()),
            });
        }
        debug!("Sent '{}' to {}", command, remote);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if self.socket.take().is_some() {
            info!("Command channel on {:?} closed", self.local_addr);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for UdpCommandChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Listener task ─────────────────────────────────────────────────────────────

async fn listen(socket: Arc<UdpSocket>, events: mpsc::Sender<ChannelEvent>) {
    let mut buf = vec![0u8; MAX_REPLY_BYTES];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let payload = Bytes::copy_from_slice(&buf[..len]);
                debug!("Reply from {}: {:?}", from, String::from_utf8_lossy(&payload));
                if events.send(ChannelEvent::Reply { payload, from }).await.is_err() {
                    debug!("Event receiver dropped; listener exiting");
                    return;
                }
            }
            Err(e) => {
                warn!("Command channel fault: {}", e);
                let _ = events.send(ChannelEvent::Fault { reason: e.to_string() }).await;
                return;
            }
        }
    }
}
