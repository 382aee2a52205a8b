//! tellolink-session
//!
//! Drives one device through `Idle → Handshaking → Streaming` and back,
//! owning the UDP command channel and the video relay for the session's
//! lifetime.

pub mod controller;
pub mod state;

pub use controller::{SessionController, SessionHandle, RELAY_EXIT_GRACE};
pub use state::{SessionStatus, StatusCell};
