//! Process-wide probe request counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ProbeMode;

/// Counter bucket a probe mode falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFamily {
    Tcp,
    Icmp,
    Http,
    Doq,
    Dns,
}

impl ProbeFamily {
    pub const ALL: [ProbeFamily; 5] = [
        ProbeFamily::Icmp,
        ProbeFamily::Tcp,
        ProbeFamily::Http,
        ProbeFamily::Doq,
        ProbeFamily::Dns,
    ];

    /// `None` for modes the agent does not know how to probe.
    pub fn for_mode(mode: &ProbeMode) -> Option<Self> {
        match mode {
            ProbeMode::Tcp => Some(ProbeFamily::Tcp),
            ProbeMode::Icmp => Some(ProbeFamily::Icmp),
            ProbeMode::Http | ProbeMode::Https => Some(ProbeFamily::Http),
            ProbeMode::Doq => Some(ProbeFamily::Doq),
            ProbeMode::Dns => Some(ProbeFamily::Dns),
            ProbeMode::Unknown(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeFamily::Tcp => "TCP",
            ProbeFamily::Icmp => "ICMP",
            ProbeFamily::Http => "HTTP",
            ProbeFamily::Doq => "DNS-over-QUIC",
            ProbeFamily::Dns => "DNS",
        }
    }
}

/// Monotonic request counts per family. Shared between all dispatch cycles.
#[derive(Debug, Default)]
pub struct ProbeCounters {
    tcp: AtomicU64,
    icmp: AtomicU64,
    http: AtomicU64,
    doq: AtomicU64,
    dns: AtomicU64,
}

impl ProbeCounters {
    fn counter(&self, family: ProbeFamily) -> &AtomicU64 {
        match family {
            ProbeFamily::Tcp => &self.tcp,
            ProbeFamily::Icmp => &self.icmp,
            ProbeFamily::Http => &self.http,
            ProbeFamily::Doq => &self.doq,
            ProbeFamily::Dns => &self.dns,
        }
    }

    /// Add `requests` and return the new total.
    pub fn add(&self, family: ProbeFamily, requests: u64) -> u64 {
        self.counter(family).fetch_add(requests, Ordering::Relaxed) + requests
    }

    pub fn get(&self, family: ProbeFamily) -> u64 {
        self.counter(family).load(Ordering::Relaxed)
    }

    /// Families whose total currently sits on a milestone.
    ///
    /// Reads are not coordinated with concurrent increments, so two cycles
    /// may occasionally report the same milestone.
    pub fn milestones(&self) -> Vec<(ProbeFamily, u64)> {
        ProbeFamily::ALL
            .iter()
            .map(|f| (*f, self.get(*f)))
            .filter(|(_, total)| is_milestone(*total))
            .collect()
    }
}

/// A milestone is every positive multiple of 10.
pub fn is_milestone(total: u64) -> bool {
    total > 0 && total % 10 == 0
}
