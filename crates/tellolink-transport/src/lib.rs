//! tellolink-transport
//!
//! The command channel: one UDP socket bound to a local port, used to fire
//! ASCII commands at the device and to listen for its replies.
//!
//! Replies and socket faults arrive on a single [`ChannelEvent`] stream
//! handed out by [`CommandTransport::open`].

pub mod channel;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tellolink_core::TransportError;
use tokio::sync::mpsc;

pub use channel::{UdpCommandChannel, UdpTransport};

/// Enter SDK mode. Must precede every other command.
pub const ENTER_SDK_COMMAND: &str = "command";
/// Ask the device to start streaming H.264 to the video port.
pub const START_VIDEO_COMMAND: &str = "streamon";

/// Handshake sent after binding, in order.
pub const HANDSHAKE: [&str; 2] = [ENTER_SDK_COMMAND, START_VIDEO_COMMAND];

// MARK: - ChannelEvent

/// Asynchronous notification from an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// One datagram received. Informational only.
    Reply { payload: Bytes, from: SocketAddr },
    /// Transport-level fault (e.g. ICMP port unreachable). The listener stops
    /// after emitting this.
    Fault { reason: String },
}

impl ChannelEvent {
    /// Reply payload as text, lossily decoded and trimmed.
    pub fn reply_text(&self) -> Option<String> {
        match self {
            Self::Reply { payload, .. } => Some(String::from_utf8_lossy(payload).trim().to_owned()),
            Self::Fault { .. } => None,
        }
    }
}

// MARK: - Transport traits

/// Opens command channels. Abstracted so the session controller can be
/// driven by scripted transports in tests.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Bind a channel to `local_port`. Bind failures are returned as-is.
    async fn open(
        &self,
        local_port: u16,
    ) -> Result<(Box<dyn CommandChannel>, mpsc::Receiver<ChannelEvent>), TransportError>;
}

/// An open command channel, exclusively owned by its opener.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send `command` as a single datagram to `remote`.
    async fn send(&self, command: &str, remote: SocketAddr) -> Result<(), TransportError>;

    /// Release the socket. Idempotent; never fails.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;
}
