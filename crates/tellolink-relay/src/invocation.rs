//! ffmpeg argument contract for the relay.
//!
//! # Pipeline
//! ```text
//! udp://0.0.0.0:11111 (raw H.264, bounded timeout, overrun non-fatal)
//!   → -c:v copy (no re-encode, audio dropped)
//!   → -f mpegts -listen 1 http://127.0.0.1:11112 (one client per listen cycle)
//! ```

use std::fmt;

use tellolink_core::{Endpoint, RelayConfig};

/// Arguments for one relay process, program excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    args: Vec<String>,
    input_url: String,
    output_url: String,
}

impl InvocationSpec {
    /// Build the relay arguments: consume raw H.264 arriving on `input`,
    /// republish it on `output` as MPEG-TS over a single-listen HTTP server.
    pub fn build(input: &Endpoint, output: &Endpoint, tuning: &RelayConfig) -> Self {
        // ffmpeg's udp `timeout` is in microseconds.
        let input_url = format!(
            "udp://{}?timeout={}&overrun_nonfatal=1&fifo_size={}",
            input,
            tuning.input_timeout().as_micros(),
            tuning.fifo_packets,
        );
        let output_url = format!("http://{output}");

        let args = [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            tuning.log_level.as_str(),
            "-fflags",
            "+nobuffer+discardcorrupt",
            "-flags",
            "low_delay",
            "-probesize",
            tuning.probe_size_bytes.to_string().as_str(),
            "-analyzeduration",
            tuning.analyze_duration_us.to_string().as_str(),
            "-f",
            "h264",
            "-i",
            input_url.as_str(),
            "-map",
            "0:v:0",
            "-c:v",
            "copy",
            "-an",
            "-f",
            "mpegts",
            "-listen",
            "1",
            output_url.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            args,
            input_url,
            output_url,
        }
    }

    /// Arbitrary argument list, for running something other than ffmpeg
    /// through the supervisor.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            input_url: String::new(),
            output_url: String::new(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn input_url(&self) -> &str {
        &self.input_url
    }

    pub fn output_url(&self) -> &str {
        &self.output_url
    }
}

impl fmt::Display for InvocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}
