//! Configuration module for the uptime agent.
//!
//! Loads the YAML configuration file named by `UPTIME_AGENT_CONFIG`
//! (default: `config.yaml`) and validates it before any probing starts.

use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "UPTIME_AGENT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_DNS_PORT: u16 = 53;
const DEFAULT_DOQ_PORT: u16 = 853;

/// Configuration error types. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How targets are driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Every target runs on its own timer.
    Async,
    /// Targets are probed one after another, forever.
    Sync,
}

/// Probe protocol declared by a target.
///
/// Matching is case-sensitive. Anything else is kept as `Unknown` so the
/// dispatcher can skip it at runtime instead of refusing to start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ProbeMode {
    Tcp,
    Icmp,
    Http,
    Https,
    Dns,
    Doq,
    Unknown(String),
}

impl From<String> for ProbeMode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "tcp" => ProbeMode::Tcp,
            "icmp" => ProbeMode::Icmp,
            "http" => ProbeMode::Http,
            "https" => ProbeMode::Https,
            "dns" => ProbeMode::Dns,
            "doq" => ProbeMode::Doq,
            _ => ProbeMode::Unknown(s),
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeMode::Tcp => "tcp",
            ProbeMode::Icmp => "icmp",
            ProbeMode::Http => "http",
            ProbeMode::Https => "https",
            ProbeMode::Dns => "dns",
            ProbeMode::Doq => "doq",
            ProbeMode::Unknown(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// How several ICMP round trips are folded into one latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyAggregation {
    Min,
    Avg,
}

/// Knobs shared by all probes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbePolicy {
    /// Sequential TCP dials per cycle; the fastest one is kept.
    pub tcp_attempts: u32,
    /// Echo requests sent per ICMP cycle.
    pub icmp_packet_count: u32,
    pub icmp_latency: LatencyAggregation,
    /// Verify the DoQ server certificate against the web PKI roots.
    pub doq_verify_tls: bool,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            tcp_attempts: 2,
            icmp_packet_count: 3,
            icmp_latency: LatencyAggregation::Avg,
            doq_verify_tls: false,
        }
    }
}

/// A monitored endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    /// Opaque identifier appended to the report URL.
    pub token: String,
    pub mode: ProbeMode,
    #[serde(default)]
    pub name: String,
    /// Probe deadline in seconds (0 means the default).
    #[serde(default)]
    pub timeout: u64,
    /// Polling period in seconds (0 means the default).
    #[serde(default)]
    pub interval: u64,

    /// `host:port`
    #[serde(default)]
    pub tcp_target: String,
    /// Host name or IP address.
    #[serde(default)]
    pub icmp_target: String,
    /// `host[:port][/path]`, the scheme comes from `mode`.
    #[serde(default)]
    pub http_target: String,

    /// Name to query.
    #[serde(default)]
    pub dns_target: String,
    #[serde(default)]
    pub dns_server: String,
    #[serde(default)]
    pub dns_server_port: u16,
    /// Numeric record type: A=1, NS=2, CNAME=5, SOA=6, PTR=12, MX=15, TXT=16, AAAA=28.
    #[serde(default = "default_dns_type")]
    pub dns_type: u16,
}

fn default_dns_type() -> u16 {
    1
}

impl Target {
    /// Label used in logs and report messages.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.token
        } else {
            &self.name
        }
    }

    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout
        };
        Duration::from_secs(secs)
    }

    pub fn interval(&self) -> Duration {
        let secs = if self.interval == 0 {
            DEFAULT_INTERVAL_SECS
        } else {
            self.interval
        };
        Duration::from_secs(secs)
    }

    /// DNS server port, defaulting per transport.
    pub fn dns_port(&self) -> u16 {
        match (self.dns_server_port, &self.mode) {
            (0, ProbeMode::Doq) => DEFAULT_DOQ_PORT,
            (0, _) => DEFAULT_DNS_PORT,
            (port, _) => port,
        }
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let missing = |field: &str| {
            ConfigError::Invalid(format!(
                "target #{} ({}) in mode {} requires `{}`",
                index,
                self.display_name(),
                self.mode,
                field
            ))
        };

        if self.token.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "target #{} has an empty token",
                index
            )));
        }

        match self.mode {
            ProbeMode::Tcp if self.tcp_target.is_empty() => Err(missing("tcp_target")),
            ProbeMode::Icmp if self.icmp_target.is_empty() => Err(missing("icmp_target")),
            ProbeMode::Http | ProbeMode::Https if self.http_target.is_empty() => {
                Err(missing("http_target"))
            }
            ProbeMode::Dns | ProbeMode::Doq if self.dns_target.is_empty() => {
                Err(missing("dns_target"))
            }
            ProbeMode::Dns | ProbeMode::Doq if self.dns_server.is_empty() => {
                Err(missing("dns_server"))
            }
            _ => Ok(()),
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(alias = "exec_mode")]
    pub api_mode: ExecMode,
    #[serde(default = "default_api_scheme")]
    pub api_scheme: String,
    #[serde(default)]
    pub api_domain: String,
    #[serde(default)]
    pub api_port: Option<u16>,
    #[serde(default)]
    pub api_path: String,
    /// Pre-composed API base; takes precedence over the split fields.
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub probe: ProbePolicy,
    /// Skip a tick while the previous cycle of the same target is running.
    #[serde(default = "default_skip_if_busy")]
    pub skip_if_busy: bool,
    #[serde(default)]
    pub targets: Vec<Target>,
}

fn default_api_scheme() -> String {
    "https".to_string()
}

fn default_skip_if_busy() -> bool {
    true
}

impl AgentConfig {
    /// Load configuration from the path in `UPTIME_AGENT_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base.is_none() {
            if self.api_domain.is_empty() {
                return Err(ConfigError::Invalid("`api_domain` is required".to_string()));
            }
            if !matches!(self.api_scheme.as_str(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "unsupported api_scheme: {}",
                    self.api_scheme
                )));
            }
        }
        if self.probe.tcp_attempts == 0 {
            return Err(ConfigError::Invalid("`tcp_attempts` must be at least 1".to_string()));
        }
        if self.probe.icmp_packet_count == 0 {
            return Err(ConfigError::Invalid(
                "`icmp_packet_count` must be at least 1".to_string(),
            ));
        }
        for (i, target) in self.targets.iter().enumerate() {
            target.validate(i)?;
        }
        Ok(())
    }

    /// Base URL that report tokens are appended to, without a trailing slash.
    pub fn api_base(&self) -> String {
        if let Some(base) = &self.api_base {
            return base.trim_end_matches('/').to_string();
        }

        let mut base = format!("{}://{}", self.api_scheme, self.api_domain);
        if let Some(port) = self.api_port {
            base.push_str(&format!(":{}", port));
        }
        let path = self.api_path.trim_matches('/');
        if !path.is_empty() {
            base.push('/');
            base.push_str(path);
        }
        base
    }
}
