//! Probe module for network monitoring.
//!
//! Supports TCP, ICMP, HTTP(S), DNS over UDP and DNS over QUIC probes.
//! Every probe returns the measured latency on success; any error means the
//! target is down for this cycle.

mod dns;
mod doq;
mod http;
mod ping;
mod tcp;

pub use dns::*;
pub use doq::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid DNS response: {0}")]
    Dns(String),
    #[error("DNS response carried no answers (rcode {rcode})")]
    NoAnswers { rcode: u8 },
    #[error("no echo replies received ({sent} sent)")]
    NoReplies { sent: u32 },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Liveness of a target for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized outcome of one dispatch cycle, handed to the reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub duration: Duration,
    pub status: Status,
    /// `"OK"` when up, a diagnostic otherwise.
    pub message: String,
}

impl ProbeResult {
    pub fn up(duration: Duration) -> Self {
        Self {
            duration,
            status: Status::Up,
            message: "OK".to_string(),
        }
    }

    pub fn down(message: String) -> Self {
        Self {
            duration: Duration::ZERO,
            status: Status::Down,
            message,
        }
    }
}

/// Resolve `host:port` to the first socket address.
pub(crate) async fn resolve_socket_addr(
    host: &str,
    port: u16,
) -> Result<std::net::SocketAddr, ProbeError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", host)))
}
