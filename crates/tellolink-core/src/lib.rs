pub mod config;
pub mod errors;
pub mod types;

pub use config::{DeviceConfig, HandshakeConfig, LinkConfig, RelayConfig};
pub use errors::{LinkError, RelayError, TransportError};
pub use types::*;
