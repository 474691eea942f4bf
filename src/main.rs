//! Uptime agent - probes configured targets and pushes their status to a
//! collection API.

mod config;
mod dispatch;
mod probe;
mod reporter;
mod scheduler;
#[cfg(test)]
mod testutil;

use config::{AgentConfig, ProbeMode};
use dispatch::{Dispatcher, ProbeCounters};
use reporter::Reporter;
use scheduler::Scheduler;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptime_agent=info".parse()?))
        .init();

    tracing::info!("Uptime agent {}", env!("CARGO_PKG_VERSION"));

    // Load configuration; any problem here is fatal
    let cfg = match AgentConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };
    let api_base = cfg.api_base();
    tracing::info!(
        "Config loaded successfully: {} targets, reporting to {}",
        cfg.targets.len(),
        api_base
    );

    if !cfg.probe.doq_verify_tls && cfg.targets.iter().any(|t| t.mode == ProbeMode::Doq) {
        tracing::warn!("DNS-over-QUIC certificate verification is disabled");
    }

    let counters = Arc::new(ProbeCounters::default());
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.probe.clone(),
        counters,
        Reporter::new(api_base),
    ));

    let scheduler = Scheduler::new(cfg.api_mode, cfg.skip_if_busy, cfg.targets, dispatcher);
    scheduler.run().await;

    Ok(())
}
