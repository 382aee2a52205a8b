//! Handle pair connecting a relay's owner with the task supervising it.
//!
//! ```text
//! RelayHandle (owner)                 RelayLink (supervisor task)
//!   cancel()        ── stop_tx ──►      cancelled().await
//!   take_completion() ◄─ oneshot ──     finish(outcome)
//!   wait_exited()   ◄── watch ───       (set on finish / drop)
//! ```

use std::time::Duration;

use tellolink_core::{RelayError, RelayOutcome};
use tokio::sync::{mpsc, oneshot, watch};

/// Owner side of a running relay. Dropping it requests cancellation.
#[derive(Debug)]
pub struct RelayHandle {
    stop_tx: mpsc::Sender<()>,
    completion: Option<oneshot::Receiver<RelayOutcome>>,
    exited: watch::Receiver<bool>,
    pid: Option<u32>,
}

/// Supervisor side of a running relay.
#[derive(Debug)]
pub struct RelayLink {
    stop_rx: mpsc::Receiver<()>,
    completion: Option<oneshot::Sender<RelayOutcome>>,
    exited: watch::Sender<bool>,
}

/// Create a connected handle/link pair for a relay with the given pid.
pub fn relay_link(pid: Option<u32>) -> (RelayHandle, RelayLink) {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let (completion_tx, completion_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(false);
    (
        RelayHandle {
            stop_tx,
            completion: Some(completion_rx),
            exited: exited_rx,
            pid,
        },
        RelayLink {
            stop_rx,
            completion: Some(completion_tx),
            exited: exited_tx,
        },
    )
}

impl RelayHandle {
    /// Request termination. Non-blocking and best-effort: a relay that has
    /// already finished yields [`RelayError::NotRunning`].
    pub fn cancel(&self) -> Result<(), RelayError> {
        match self.stop_tx.try_send(()) {
            // Full: a cancel is already pending.
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(RelayError::NotRunning),
        }
    }

    /// The completion notification. Available exactly once.
    pub fn take_completion(&mut self) -> Option<oneshot::Receiver<RelayOutcome>> {
        self.completion.take()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait until the process is gone, at most `grace`. Returns whether it
    /// exited in time.
    pub async fn wait_exited(&mut self, grace: Duration) -> bool {
        let exited = self.exited.wait_for(|exited| *exited);
        match tokio::time::timeout(grace, exited).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl RelayLink {
    /// Resolves once the owner called [`RelayHandle::cancel`] or dropped the
    /// handle.
    pub async fn cancelled(&mut self) {
        let _ = self.stop_rx.recv().await;
    }

    /// Deliver the terminal outcome and mark the relay as exited.
    pub fn finish(mut self, outcome: RelayOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
        self.exited.send_replace(true);
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.exited.send_replace(true);
    }
}
