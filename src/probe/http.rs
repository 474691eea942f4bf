//! HTTP probe implementation.

use std::time::{Duration, Instant};
use super::ProbeError;

/// Run an HTTP(S) probe: `GET {scheme}://{address}`.
///
/// Any response counts as reachable; the status code is not inspected and
/// the body is dropped unread. Latency runs until the response headers.
pub async fn run_http_probe(
    scheme: &str,
    address: &str,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let url = format!("{}://{}", scheme, address);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let start = Instant::now();

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    let elapsed = start.elapsed();
    drop(response);

    Ok(elapsed)
}
