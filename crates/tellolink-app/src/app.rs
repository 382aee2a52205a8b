use std::sync::Arc;

use anyhow::{Context, Result};
use tellolink_core::{LinkConfig, SessionState};
use tellolink_relay::ProcessRelay;
use tellolink_session::{SessionController, SessionHandle, SessionStatus};
use tellolink_transport::UdpTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

/// One line typed at the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" | "s" => Some(Self::Start),
            "stop" | "x" => Some(Self::Stop),
            "status" | "?" => Some(Self::Status),
            "help" | "h" => Some(Self::Help),
            "quit" | "q" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Console front end.
///
/// # Flow
/// 1. Load [`LinkConfig`] (defaults, `TELLOLINK_CONFIG` file, env overrides)
/// 2. Locate ffmpeg and spawn the session controller
/// 3. Read `start` / `stop` / `status` / `quit` from stdin until EOF or Ctrl-C
/// 4. Shut the session down, which stops the relay and frees the ports
pub async fn run() -> Result<()> {
    let config = LinkConfig::load().context("loading configuration")?;
    let runner = ProcessRelay::ffmpeg(&config.relay).context("locating ffmpeg")?;
    info!(
        "Device {} | commands from :{} | video on :{} | playback at {}",
        config.device.command_endpoint,
        config.device.local_command_port,
        config.device.video_port,
        config.relay.playback_url()
    );

    let (session, task) = SessionController::spawn(config, Arc::new(UdpTransport), Arc::new(runner));
    let reporter = tokio::spawn(report(session.subscribe()));
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(command) => dispatch(&session, command),
                    None => warn!("Unknown command '{}' (try 'help')", line.trim()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    session.shutdown().await;
    task.await.context("session controller panicked")?;
    reporter.abort();
    Ok(())
}

fn dispatch(session: &SessionHandle, command: Command) {
    match command {
        Command::Start => session.start(),
        Command::Stop => session.stop(),
        Command::Status => println!("{}", describe(&session.status())),
        Command::Help => print_help(),
        Command::Quit => {}
    }
}

fn print_help() {
    println!("Commands: start | stop | status | help | quit");
}

/// Print every state change until the controller goes away.
async fn report(mut status: watch::Receiver<SessionStatus>) {
    let mut last = status.borrow_and_update().state;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if current.state != last {
            println!("{}", describe(&current));
            last = current.state;
        }
    }
}

fn describe(status: &SessionStatus) -> String {
    let session = status
        .session
        .map(|id| format!(" {id}"))
        .unwrap_or_default();
    match status.state {
        SessionState::Streaming => format!(
            "[{}]{} open {} in a player (replies: {})",
            status.state,
            session,
            status.playback_url.as_deref().unwrap_or("-"),
            status.device_replies
        ),
        SessionState::Error => format!(
            "[{}]{} {}",
            status.state,
            session,
            status.error.as_deref().unwrap_or("unknown error")
        ),
        _ => format!("[{}]{}", status.state, session),
    }
}
