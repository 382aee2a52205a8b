use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::LinkError;
use crate::types::Endpoint;

/// Env var naming an optional JSON config file.
pub const CONFIG_ENV: &str = "TELLOLINK_CONFIG";

// MARK: - LinkConfig

/// Complete runtime configuration. Every field has a working default for a
/// Tello on its own access point, so an empty JSON object is a valid file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub device: DeviceConfig,
    pub handshake: HandshakeConfig,
    pub relay: RelayConfig,
}

/// Where the device listens and where it sends video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device command endpoint (one ASCII command per datagram).
    #[serde(alias = "commandEndpoint")]
    pub command_endpoint: Endpoint,
    /// Local UDP port the command channel binds to.
    #[serde(alias = "localCommandPort")]
    pub local_command_port: u16,
    /// Local UDP port the device streams raw H.264 to.
    #[serde(alias = "videoPort")]
    pub video_port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            command_endpoint: Endpoint::new("192.168.10.1", 8889),
            local_command_port: 8889,
            video_port: 11111,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Pause after each handshake command before the next step.
    #[serde(alias = "settleDelayMs")]
    pub settle_delay_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { settle_delay_ms: 500 }
    }
}

impl HandshakeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// ffmpeg relay tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Explicit ffmpeg path; `None` searches `PATH`.
    #[serde(alias = "ffmpegPath")]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(alias = "outputHost")]
    pub output_host: String,
    #[serde(alias = "outputPort")]
    pub output_port: u16,
    /// How long the relay waits for the first input packet before failing.
    #[serde(alias = "inputTimeoutMs")]
    pub input_timeout_ms: u64,
    #[serde(alias = "probeSizeBytes")]
    pub probe_size_bytes: u32,
    #[serde(alias = "analyzeDurationUs")]
    pub analyze_duration_us: u64,
    /// UDP receive FIFO depth, in 188-byte packets.
    #[serde(alias = "fifoPackets")]
    pub fifo_packets: u32,
    #[serde(alias = "logLevel")]
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            output_host: "127.0.0.1".to_owned(),
            output_port: 11112,
            input_timeout_ms: 5_000,
            probe_size_bytes: 32_768,
            analyze_duration_us: 1_000_000,
            fifo_packets: 50_000,
            log_level: "info".to_owned(),
        }
    }
}

impl RelayConfig {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    /// URL the presentation surface plays while streaming.
    pub fn playback_url(&self) -> String {
        format!("http://{}:{}", self.output_host, self.output_port)
    }
}

// MARK: - Loading

impl LinkConfig {
    /// Defaults, then the file named by `TELLOLINK_CONFIG` (if set), then the
    /// individual env overrides.
    pub fn load() -> Result<Self, LinkError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, LinkError> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text).map_err(|e| LinkError::ConfigurationInvalid {
            reason: format!("{}: {e}", path.display()),
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Applies `TELLOLINK_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), LinkError> {
        if let Some(addr) = lookup("TELLOLINK_DEVICE_ADDR") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(|| LinkError::ConfigurationInvalid {
                reason: format!("TELLOLINK_DEVICE_ADDR '{addr}' is not host:port"),
            })?;
            self.device.command_endpoint = Endpoint::new(host, parse_port("TELLOLINK_DEVICE_ADDR", port)?);
        }
        if let Some(port) = lookup("TELLOLINK_COMMAND_PORT") {
            self.device.local_command_port = parse_port("TELLOLINK_COMMAND_PORT", &port)?;
        }
        if let Some(port) = lookup("TELLOLINK_VIDEO_PORT") {
            self.device.video_port = parse_port("TELLOLINK_VIDEO_PORT", &port)?;
        }
        if let Some(port) = lookup("TELLOLINK_OUTPUT_PORT") {
            self.relay.output_port = parse_port("TELLOLINK_OUTPUT_PORT", &port)?;
        }
        if let Some(path) = lookup("TELLOLINK_FFMPEG") {
            debug!("ffmpeg path overridden: {}", path);
            self.relay.ffmpeg_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        let invalid = |reason: &str| -> Result<(), LinkError> {
            Err(LinkError::ConfigurationInvalid {
                reason: reason.to_owned(),
            })
        };
        if self.device.command_endpoint.port == 0 || self.device.video_port == 0 || self.relay.output_port == 0 {
            return invalid("ports must be non-zero");
        }
        if self.relay.output_port == self.device.video_port {
            return invalid("relay output port must differ from the video port");
        }
        if self.relay.input_timeout_ms == 0 {
            return invalid("relay input timeout must be positive");
        }
        self.device.command_endpoint.socket_addr()?;
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, LinkError> {
    value.trim().parse().map_err(|_| LinkError::ConfigurationInvalid {
        reason: format!("{key}: '{value}' is not a port number"),
    })
}
