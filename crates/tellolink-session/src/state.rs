use std::collections::VecDeque;

use tellolink_core::{SessionId, SessionState};
use tokio::sync::watch;

/// Entries kept in [`SessionStatus::log`].
const LOG_CAPACITY: usize = 100;

// ── SessionStatus ─────────────────────────────────────────────────────────────

/// Snapshot published to observers on every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Human-readable reason for the last failure; only set in `Error`.
    pub error: Option<String>,
    /// Session the state refers to; `None` while idle.
    pub session: Option<SessionId>,
    /// Where to point the player. Only `Some` while streaming.
    pub playback_url: Option<String>,
    pub device_replies: u64,
    pub last_reply: Option<String>,
    /// Recent lifecycle lines, oldest first.
    pub log: VecDeque<String>,
}

impl SessionStatus {
    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    fn push_log(&mut self, line: impl Into<String>) {
        if self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line.into());
    }
}

// ── StatusCell ────────────────────────────────────────────────────────────────

/// The single writable copy of the session status. Owned by the controller;
/// everyone else gets a `watch::Receiver`.
pub struct StatusCell {
    tx: watch::Sender<SessionStatus>,
    playback_url: String,
}

impl StatusCell {
    pub fn new(playback_url: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(SessionStatus::default());
        Self {
            tx,
            playback_url: playback_url.into(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.tx.borrow().state
    }

    pub fn handshaking(&self, session: SessionId) {
        self.tx.send_modify(|s| {
            s.state = SessionState::Handshaking;
            s.error = None;
            s.session = Some(session);
            s.playback_url = None;
            s.push_log(format!("Session {session}: handshaking"));
        });
    }

    pub fn streaming(&self) {
        let url = self.playback_url.clone();
        self.tx.send_modify(|s| {
            s.state = SessionState::Streaming;
            s.push_log(format!("Streaming at {url}"));
            s.playback_url = Some(url);
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| {
            s.state = SessionState::Error;
            s.playback_url = None;
            s.push_log(format!("[ERROR] {}", message.lines().next().unwrap_or_default()));
            s.error = Some(message);
        });
    }

    /// Back to idle with the error cleared. Observers are only notified if
    /// something actually changed.
    pub fn idle(&self) {
        self.tx.send_if_modified(|s| {
            if s.state == SessionState::Idle && s.error.is_none() && s.session.is_none() {
                return false;
            }
            s.state = SessionState::Idle;
            s.error = None;
            s.session = None;
            s.playback_url = None;
            s.push_log("Idle");
            true
        });
    }

    pub fn record_reply(&self, text: impl Into<String>) {
        let text = text.into();
        self.tx.send_modify(|s| {
            s.device_replies += 1;
            s.push_log(format!("Device: {text}"));
            s.last_reply = Some(text);
        });
    }
}
