//! Probe dispatcher: runs one cycle for a target.
//!
//! A cycle picks the probe for the target's mode, normalizes the outcome to
//! `(duration, status, message)`, updates the counters, logs, and hands the
//! result to the reporter.

mod counters;

pub use counters::*;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ProbeMode, ProbePolicy, Target};
use crate::probe::{
    run_dns_probe, run_doq_probe, run_http_probe, run_icmp_probe, run_tcp_probe, ProbeError,
    ProbeResult,
};
use crate::reporter::Reporter;

/// Dispatches probe cycles and owns the shared counters.
pub struct Dispatcher {
    policy: ProbePolicy,
    counters: Arc<ProbeCounters>,
    reporter: Reporter,
}

impl Dispatcher {
    pub fn new(policy: ProbePolicy, counters: Arc<ProbeCounters>, reporter: Reporter) -> Self {
        Self {
            policy,
            counters,
            reporter,
        }
    }

    #[cfg(test)]
    pub fn counters(&self) -> &Arc<ProbeCounters> {
        &self.counters
    }

    /// Run one dispatch cycle.
    ///
    /// Returns `None` when the target's mode is unknown; nothing is probed,
    /// counted or reported in that case.
    pub async fn dispatch(&self, target: &Target) -> Option<ProbeResult> {
        let Some(family) = ProbeFamily::for_mode(&target.mode) else {
            tracing::warn!(
                "Invalid mode {:?} for target {}, skipping",
                target.mode.to_string(),
                target.display_name()
            );
            return None;
        };

        let (outcome, issued) = self.run_probe(target, family).await;
        self.counters.add(family, issued);

        let result = match outcome {
            Ok(latency) => ProbeResult::up(latency),
            Err(e) => {
                tracing::warn!(
                    "Error probing {} target ({}): {}",
                    target.mode,
                    target.display_name(),
                    e
                );
                ProbeResult::down(format!(
                    "[Error] Cannot connect to {} ({})",
                    target.display_name(),
                    failure_label(&target.mode)
                ))
            }
        };

        tracing::info!(
            "[{}] to [{}], latency: {} ms, status: {}",
            target.mode.to_string().to_uppercase(),
            target.display_name(),
            result.duration.as_millis(),
            result.status.as_str().to_uppercase()
        );

        // Best-effort; the outcome has already been logged by the reporter.
        let _ = self.reporter.report(&target.token, &result).await;

        for (family, total) in self.counters.milestones() {
            tracing::info!("Total {} requests: {}", family.label(), total);
        }

        Some(result)
    }

    /// Run the probe for `family` and report how many packets or requests
    /// actually went out alongside the latency.
    async fn run_probe(
        &self,
        target: &Target,
        family: ProbeFamily,
    ) -> (Result<Duration, ProbeError>, u64) {
        let timeout = target.timeout();

        match family {
            ProbeFamily::Tcp => {
                let attempts = self.policy.tcp_attempts.max(1);
                let outcome = run_tcp_probe(&target.tcp_target, attempts, timeout).await;
                (outcome, attempts as u64)
            }
            ProbeFamily::Icmp => {
                let icmp =
                    run_icmp_probe(&target.icmp_target, self.policy.icmp_packet_count, timeout);
                match icmp.await {
                    Ok(stats) => (stats.latency(self.policy.icmp_latency), stats.sent as u64),
                    Err(e) => (Err(e), 0),
                }
            }
            ProbeFamily::Http => {
                let scheme = if target.mode == ProbeMode::Https {
                    "https"
                } else {
                    "http"
                };
                (run_http_probe(scheme, &target.http_target, timeout).await, 1)
            }
            ProbeFamily::Dns => {
                let outcome = run_dns_probe(
                    &target.dns_server,
                    target.dns_port(),
                    &target.dns_target,
                    target.dns_type,
                    timeout,
                )
                .await;
                (outcome, 1)
            }
            ProbeFamily::Doq => {
                let outcome = run_doq_probe(
                    &target.dns_server,
                    target.dns_port(),
                    &target.dns_target,
                    target.dns_type,
                    self.policy.doq_verify_tls,
                    timeout,
                )
                .await;
                (outcome, 1)
            }
        }
    }
}

fn failure_label(mode: &ProbeMode) -> String {
    match mode {
        ProbeMode::Tcp => "TCP".to_string(),
        ProbeMode::Icmp => "ICMP".to_string(),
        ProbeMode::Dns => "DNS".to_string(),
        ProbeMode::Doq => "DNS-over-QUIC".to_string(),
        other => other.to_string(),
    }
}
