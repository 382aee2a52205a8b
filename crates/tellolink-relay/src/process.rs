//! Relay runner that spawns the ffmpeg process and supervises it on a tokio
//! task until it exits or is cancelled.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tellolink_core::{RelayConfig, RelayError, RelayOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::handle::{relay_link, RelayHandle, RelayLink};
use crate::{InvocationSpec, RelayRunner};

const FFMPEG: &str = "ffmpeg";

/// How long to keep reading stderr after the process exited. A grandchild
/// holding the pipe open must not keep the outcome from being reported.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(2);

type LogBuffer = Arc<Mutex<String>>;

/// Locate the ffmpeg binary: the configured path if any, otherwise `PATH`.
pub fn locate_ffmpeg(config: &RelayConfig) -> Result<PathBuf, RelayError> {
    if let Some(path) = &config.ffmpeg_path {
        if path.is_file() {
            return Ok(path.clone());
        }
        warn!("Configured ffmpeg '{}' does not exist", path.display());
        return Err(RelayError::BinaryNotFound {
            name: path.display().to_string(),
        });
    }
    which::which(FFMPEG).map_err(|_| RelayError::BinaryNotFound { name: FFMPEG.to_owned() })
}

// ── ProcessRelay ──────────────────────────────────────────────────────────────

/// Launches relay invocations as child processes of `program`.
#[derive(Debug, Clone)]
pub struct ProcessRelay {
    program: PathBuf,
}

impl ProcessRelay {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Runner for the ffmpeg found by [`locate_ffmpeg`].
    pub fn ffmpeg(config: &RelayConfig) -> Result<Self, RelayError> {
        let program = locate_ffmpeg(config)?;
        info!("Using relay binary {}", program.display());
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl RelayRunner for ProcessRelay {
    fn launch(&self, spec: &InvocationSpec) -> Result<RelayHandle, RelayError> {
        debug!("Launching {} {}", self.program.display(), spec);
        let mut child = Command::new(&self.program)
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::LaunchFailed {
                reason: format!("{}: {e}", self.program.display()),
            })?;

        let pid = child.id();
        info!("Relay started (pid {:?}) → {}", pid, spec.output_url());

        let stderr = child.stderr.take();
        let (handle, link) = relay_link(pid);
        tokio::spawn(supervise(child, stderr, link));
        Ok(handle)
    }
}

// ── Supervisor task ───────────────────────────────────────────────────────────

async fn supervise(mut child: Child, stderr: Option<ChildStderr>, mut link: RelayLink) {
    let log = LogBuffer::default();
    let log_task = stderr.map(|stderr| tokio::spawn(collect_log(stderr, Arc::clone(&log))));

    let outcome = tokio::select! {
        biased;

        status = child.wait() => match status {
            Ok(status) if status.success() => {
                info!("Relay exited cleanly");
                RelayOutcome::Success
            }
            Ok(status) => RelayOutcome::Failed {
                exit_code: status.code(),
                log: drain_log(log_task, &log).await,
            },
            Err(e) => RelayOutcome::Failed {
                exit_code: None,
                log: format!("waiting on relay process failed: {e}"),
            },
        },

        _ = link.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill relay: {}", e);
            }
            info!("Relay cancelled");
            RelayOutcome::Cancelled
        }
    };

    if let RelayOutcome::Failed { exit_code, log } = &outcome {
        warn!("Relay failed (exit code {:?}), {} bytes of log", exit_code, log.len());
    }
    link.finish(outcome);
}

/// Read stderr to EOF, mirroring each line to the log.
async fn collect_log(stderr: ChildStderr, log: LogBuffer) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "tellolink::ffmpeg", "{}", line);
                append(&log, &line);
            }
            Ok(None) => break,
            Err(e) => {
                append(&log, &format!("<stderr read error: {e}>"));
                break;
            }
        }
    }
}

fn append(log: &LogBuffer, line: &str) {
    if let Ok(mut log) = log.lock() {
        log.push_str(line);
        log.push('\n');
    }
}

/// Wait for the reader to hit EOF, at most [`LOG_DRAIN_GRACE`], and take
/// whatever was captured.
async fn drain_log(task: Option<tokio::task::JoinHandle<()>>, log: &LogBuffer) -> String {
    if let Some(mut task) = task {
        if tokio::time::timeout(LOG_DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
            warn!("Relay stderr still open {:?} after exit; log may be incomplete", LOG_DRAIN_GRACE);
        }
    }
    match log.lock() {
        Ok(mut log) => std::mem::take(&mut *log),
        Err(_) => String::new(),
    }
}
