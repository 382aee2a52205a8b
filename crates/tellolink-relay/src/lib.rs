//! tellolink-relay
//!
//! Bridges the device's raw UDP H.264 feed to a local HTTP endpoint by
//! running ffmpeg as an opaque external process.
//!
//! # Flow
//! ```text
//! InvocationSpec::build(udp in, http out)
//!   → RelayRunner::launch(spec)          returns immediately
//!       └─ RelayHandle
//!            ├─ cancel()                 best-effort, NotRunning if finished
//!            └─ take_completion()        Success | Cancelled | Failed { log }
//! ```

pub mod handle;
pub mod invocation;
pub mod process;

use tellolink_core::RelayError;

pub use handle::{relay_link, RelayHandle, RelayLink};
pub use invocation::InvocationSpec;
pub use process::{locate_ffmpeg, ProcessRelay};

/// Launches relay invocations.
///
/// Implementations must not block: the process is started in the background
/// and its terminal outcome is delivered exactly once through the handle's
/// completion receiver.
pub trait RelayRunner: Send + Sync {
    fn launch(&self, spec: &InvocationSpec) -> Result<RelayHandle, RelayError>;
}
