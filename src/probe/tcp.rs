//! TCP probe implementation.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::ProbeError;

/// Dial `address` (`host:port`) `attempts` times and keep the fastest connect.
///
/// Every attempt has its own `timeout` and is always made. Any failed attempt
/// fails the probe with the first error seen.
pub async fn run_tcp_probe(
    address: &str,
    attempts: u32,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    best_of(attempts, || dial_once(address, timeout)).await
}

/// Run `attempt` `attempts` times in sequence and return the minimum latency.
async fn best_of<F, Fut>(attempts: u32, mut attempt: F) -> Result<Duration, ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Duration, ProbeError>>,
{
    let mut best: Option<Duration> = None;
    let mut first_error: Option<ProbeError> = None;

    for _ in 0..attempts.max(1) {
        match attempt().await {
            Ok(latency) => best = Some(best.map_or(latency, |b| b.min(latency))),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    best.ok_or_else(|| ProbeError::Config("no TCP attempts configured".to_string()))
}

async fn dial_once(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();

    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to connect to {}: {}", address, e)))?;

    let elapsed = start.elapsed();
    drop(stream);

    Ok(elapsed)
}
