//! Scheduler module for driving dispatch cycles.
//!
//! `async` mode gives every target its own timer; `sync` mode walks the
//! target list in order forever, sleeping each target's interval after it.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{ExecMode, Target};
use crate::dispatch::Dispatcher;

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    mode: ExecMode,
    skip_if_busy: bool,
    targets: Vec<Arc<Target>>,
    dispatcher: Arc<Dispatcher>,
}

impl Scheduler {
    pub fn new(
        mode: ExecMode,
        skip_if_busy: bool,
        targets: Vec<Target>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            mode,
            skip_if_busy,
            targets: targets.into_iter().map(Arc::new).collect(),
            dispatcher,
        }
    }

    /// Run until the process is terminated. Returns early only when there is
    /// nothing to monitor.
    pub async fn run(&self) {
        if self.targets.is_empty() {
            tracing::warn!("No targets configured, nothing to monitor");
            return;
        }

        tracing::info!(
            "Starting scheduler with {} targets ({:?} mode)",
            self.targets.len(),
            self.mode
        );

        match self.mode {
            ExecMode::Async => self.run_concurrent().await,
            ExecMode::Sync => self.run_sequential().await,
        }
    }

    async fn run_concurrent(&self) {
        let mut tasks = JoinSet::new();

        for target in &self.targets {
            tracing::info!(
                "Scheduler: adding target {} every {:?}",
                target.display_name(),
                target.interval()
            );
            tasks.spawn(run_target_loop(
                target.clone(),
                self.dispatcher.clone(),
                self.skip_if_busy,
            ));
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!("Scheduler: target task exited: {}", e);
            }
        }
    }

    async fn run_sequential(&self) {
        loop {
            for target in &self.targets {
                self.dispatcher.dispatch(target).await;
                tokio::time::sleep(target.interval()).await;
            }
        }
    }
}

/// Run the probe loop for a single target.
async fn run_target_loop(target: Arc<Target>, dispatcher: Arc<Dispatcher>, skip_if_busy: bool) {
    let busy = Arc::new(Semaphore::new(1));

    let mut interval = tokio::time::interval(target.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let permit = if skip_if_busy {
            match busy.clone().try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    tracing::warn!(
                        "Skipping probe for {}: previous cycle still running",
                        target.display_name()
                    );
                    continue;
                }
            }
        } else {
            None
        };

        let target = target.clone();
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let _permit = permit; // Hold permit until done
            dispatcher.dispatch(&target).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ProbePolicy};
    use crate::dispatch::{ProbeCounters, ProbeFamily};
    use crate::probe::spawn_fake_dns_server;
    use crate::reporter::Reporter;
    use crate::testutil::{closed_tcp_addr, spawn_mock_api, MockReply};
    use axum::{routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler_from(yaml: &str, api_base: &str) -> (Scheduler, Arc<ProbeCounters>) {
        let cfg = AgentConfig::from_yaml(yaml).unwrap();
        let counters = Arc::new(ProbeCounters::default());
        let dispatcher = Arc::new(Dispatcher::new(
            ProbePolicy::default(),
            counters.clone(),
            Reporter::new(api_base),
        ));
        let scheduler = Scheduler::new(cfg.api_mode, cfg.skip_if_busy, cfg.targets, dispatcher);
        (scheduler, counters)
    }

    #[tokio::test]
    async fn test_no_targets_returns() {
        let (scheduler, _) = scheduler_from("api_mode: async\napi_domain: x\n", "http://127.0.0.1:1");
        tokio::time::timeout(Duration::from_secs(1), scheduler.run())
            .await
            .expect("scheduler with no targets should return");
    }

    #[tokio::test]
    async fn test_sync_mode_loops_forever() {
        let api = spawn_mock_api(MockReply::Ok(true)).await;
        let closed = closed_tcp_addr().await;
        let (scheduler, counters) = scheduler_from(
            &format!(
                "api_mode: sync\napi_domain: x\ntargets:\n  - token: t\n    mode: tcp\n    interval: 1\n    timeout: 1\n    tcp_target: \"{}\"\n",
                closed
            ),
            &api.base,
        );

        // Cycles start at roughly 0s, 1s and 2s.
        let res = tokio::time::timeout(Duration::from_millis(2500), scheduler.run()).await;
        assert!(res.is_err(), "sync scheduler must not finish on its own");

        let hits = api.hits();
        assert!(hits.len() >= 2, "expected repeated sweeps, got {}", hits.len());
        assert!(hits.iter().all(|h| h.query["status"] == "down"));
        assert_eq!(counters.get(ProbeFamily::Tcp), 2 * hits.len() as u64);
    }

    #[tokio::test]
    async fn test_async_mode_runs_all_targets() {
        let api = spawn_mock_api(MockReply::Ok(true)).await;
        let closed = closed_tcp_addr().await;
        let dns = spawn_fake_dns_server(1).await;
        let (scheduler, counters) = scheduler_from(
            &format!(
                r#"api_mode: async
api_domain: x
targets:
  - token: tcp
    mode: tcp
    interval: 1
    timeout: 1
    tcp_target: "{}"
  - token: dns
    mode: dns
    interval: 1
    dns_target: example.com
    dns_server: 127.0.0.1
    dns_server_port: {}
"#,
                closed,
                dns.port()
            ),
            &api.base,
        );

        let _ = tokio::time::timeout(Duration::from_millis(1500), scheduler.run()).await;

        assert!(counters.get(ProbeFamily::Tcp) >= 2);
        assert!(counters.get(ProbeFamily::Dns) >= 1);
        let hits = api.hits();
        assert!(hits.iter().any(|h| h.token == "tcp" && h.query["status"] == "down"));
        assert!(hits.iter().any(|h| h.token == "dns" && h.query["status"] == "up"));
    }

    async fn slow_http_server(delay: Duration) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    "slow"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, calls)
    }

    fn slow_target_yaml(addr: std::net::SocketAddr, skip_if_busy: bool) -> String {
        format!(
            "api_mode: async\napi_domain: x\nskip_if_busy: {}\ntargets:\n  - token: slow\n    mode: http\n    interval: 1\n    timeout: 10\n    http_target: \"{}/\"\n",
            skip_if_busy, addr
        )
    }

    #[tokio::test]
    async fn test_skip_if_busy() {
        let api = spawn_mock_api(MockReply::Ok(true)).await;
        let (addr, calls) = slow_http_server(Duration::from_secs(5)).await;
        let (scheduler, _) = scheduler_from(&slow_target_yaml(addr, true), &api.base);

        let _ = tokio::time::timeout(Duration::from_millis(2500), scheduler.run()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlap_allowed_when_not_skipping() {
        let api = spawn_mock_api(MockReply::Ok(true)).await;
        let (addr, calls) = slow_http_server(Duration::from_secs(5)).await;
        let (scheduler, _) = scheduler_from(&slow_target_yaml(addr, false), &api.base);

        let _ = tokio::time::timeout(Duration::from_millis(2500), scheduler.run()).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
