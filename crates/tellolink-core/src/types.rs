use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::errors::LinkError;

// MARK: - Endpoint

/// A (host, port) pair. The device command endpoint and the video source are
/// both fixed by configuration and never change within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses the endpoint into a socket address. Only literal IP hosts are
    /// accepted; the device is always addressed by IP on its own access point.
    pub fn socket_addr(&self) -> Result<SocketAddr, LinkError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| LinkError::ConfigurationInvalid {
                reason: format!("'{}' is not an IP endpoint", self),
            })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// MARK: - SessionId

/// Monotonically increasing identifier of one start attempt.
///
/// Every channel event and relay completion is tagged with the id of the
/// session that produced it, so notifications from a superseded session can
/// be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// MARK: - SessionState

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Handshaking,
    Streaming,
    Error,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Handshaking => "Handshaking…",
            Self::Streaming => "Streaming",
            Self::Error => "Error",
        }
    }

    /// True while the controller owns a command channel (and possibly a relay).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Handshaking | Self::Streaming)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// MARK: - RelayOutcome

/// Terminal outcome of one relay invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The process exited with status 0 (its single client went away).
    Success,
    /// The process was terminated because cancellation was requested.
    Cancelled,
    /// Any other exit. `log` is everything the process wrote to stderr.
    Failed { exit_code: Option<i32>, log: String },
}

impl RelayOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
