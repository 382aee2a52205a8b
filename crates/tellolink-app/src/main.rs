use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=debug for handshake detail, RUST_LOG=tellolink::ffmpeg=debug for relay output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("TelloLink v{}", env!("CARGO_PKG_VERSION"));

    // Config or ffmpeg lookup failures end here before any socket is bound;
    // once the console loop runs, session errors stay in the session status.
    match app::run().await {
        Ok(()) => {
            info!("TelloLink exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
