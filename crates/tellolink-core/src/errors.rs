use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// The relay process exited unsuccessfully. The log is kept whole; it is
    /// the only trace available for diagnosing transcode failures.
    #[error("Relay process failed ({}):\n{log}", describe_exit(.exit_code))]
    RelayFailure { exit_code: Option<i32>, log: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_owned(),
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Send of '{command}' failed: {reason}")]
    SendFailed { command: String, reason: String },

    #[error("Socket fault: {reason}")]
    SocketFault { reason: String },

    #[error("Channel closed")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay binary '{name}' not found")]
    BinaryNotFound { name: String },

    #[error("Failed to launch relay: {reason}")]
    LaunchFailed { reason: String },

    /// Cancellation target has already finished. Callers treat this as benign.
    #[error("Relay is not running")]
    NotRunning,
}
