//! The cooperative tick loop: one pass every CHECK_INTERVAL through gateway
//! health, agent heartbeats, the config safeguard, the backup archiver, and
//! log housekeeping.
//!
//! All restart paths funnel through [`Supervisor::issue_restart`], so the
//! cooldown gate holds across every module: at most one restart per tick and
//! per cooldown interval, whoever asked for it.

use crate::backup::{ArchiveOutcome, FileHistoryArchiver, RateLimited};
use crate::config::SupervisorConfig;
use crate::epoch_now;
use crate::metrics::OpsMetrics;
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use warden_health::{
    GatewayHealthEngine, HealthPolicy, RestartReason, TickDecision, TickSignals,
};
use warden_heartbeat::{parse_workspaces, GatewayCondition, HeartbeatAction, HeartbeatMonitor};
use warden_persist::{trim_log, PidFile};
use warden_probes::{is_healthy_status, GatewayProbes};
use warden_safeguard::{ConfigSafeguard, SafeguardEvent};

/// Seconds between the two liveness probes that confirm a dead gateway.
const LIVENESS_REPROBE: Duration = Duration::from_secs(5);
/// Per-probe HTTP deadline.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// End-to-end deadline for the proxied API probe.
const PROXY_TIMEOUT: Duration = Duration::from_secs(8);
/// TCP connect deadline for the proxy socket itself.
const PROXY_SOCKET_TIMEOUT: Duration = Duration::from_secs(3);
/// Post-restart health polling: attempts × spacing.
const POST_RESTART_POLLS: u32 = 6;
const POST_RESTART_SPACING: Duration = Duration::from_secs(5);
/// Log trim and counter summary cadence, in ticks.
const HOUSEKEEPING_TICKS: u64 = 40;

/// The supervisor loop over a set of probes (live system in production,
/// scripted fakes in tests).
pub struct Supervisor<P: GatewayProbes> {
    cfg: SupervisorConfig,
    probes: P,
    engine: GatewayHealthEngine,
    heartbeat: HeartbeatMonitor,
    safeguard: ConfigSafeguard,
    backup: RateLimited<FileHistoryArchiver>,
    metrics: OpsMetrics,
    tick_count: u64,
}

impl<P: GatewayProbes> Supervisor<P> {
    pub fn new(cfg: SupervisorConfig, probes: P) -> Self {
        let policy = HealthPolicy {
            check_interval: cfg.check_interval,
            cooldown: cfg.cooldown,
            backoff_initial: cfg.backoff_initial,
            backoff_max: cfg.backoff_max,
            backoff_multiplier: cfg.backoff_multiplier,
            proxy_fail_threshold: cfg.proxy_fail_threshold,
        };
        let heartbeat = HeartbeatMonitor::new(
            parse_workspaces(&cfg.agent_workspaces),
            cfg.heartbeat_check_interval,
            cfg.heartbeat_threshold_min,
        );
        let safeguard = ConfigSafeguard::new(
            cfg.config_path.clone(),
            &cfg.state_dir,
            cfg.rollback_timeout,
            cfg.snapshot_retention,
        );
        let backup = RateLimited::new(
            FileHistoryArchiver::new(cfg.config_path.clone(), cfg.backups_dir()),
            cfg.backup_interval,
        );
        Self {
            cfg,
            probes,
            engine: GatewayHealthEngine::new(policy),
            heartbeat,
            safeguard,
            backup,
            metrics: OpsMetrics::new(),
            tick_count: 0,
        }
    }

    /// Run until SIGTERM/SIGINT. Releases the pid file on the way out;
    /// in-flight subprocesses finish within their own timeouts.
    pub async fn run(mut self, pid_file: PidFile) -> Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            interval = self.cfg.check_interval,
            service = %self.cfg.service_label,
            agents = self.heartbeat.agent_count(),
            "supervisor started"
        );
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.check_interval)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
            }
        }

        pid_file.release();
        self.metrics.log_summary();
        info!("supervisor stopped");
        Ok(())
    }

    /// One full pass: health, heartbeats, safeguard, backup, housekeeping.
    /// Module order matters: wake/network gating runs before config
    /// decisions, and the safeguard samples health freshly, never reusing
    /// what the classifier saw earlier in the same tick.
    pub async fn tick(&mut self) {
        self.tick_count += 1;
        self.metrics.ticks.inc();

        // ── Gateway health ────────────────────────────────────────────────
        let signals = self.sample_signals().await;
        let decision = self.engine.observe(&signals, epoch_now());
        self.execute_decision(decision).await;

        // ── Agent heartbeats (self rate-limited) ──────────────────────────
        let now_utc = Utc::now();
        if self.heartbeat.agent_count() > 0 && self.heartbeat.due(now_utc) {
            let condition = self.gateway_condition().await;
            if let Some(report) = self.heartbeat.sweep(now_utc, condition) {
                self.metrics.heartbeat_sweeps.inc();
                if report.action == HeartbeatAction::RequestRestart {
                    self.issue_restart(RestartReason::AgentsStaleGatewayDead, epoch_now())
                        .await;
                }
            }
        }

        // ── Config safeguard ──────────────────────────────────────────────
        let healthy = self.gateway_condition().await == GatewayCondition::Healthy;
        match self.safeguard.tick(healthy, epoch_now()) {
            SafeguardEvent::RolledBack { snapshot } => {
                self.metrics.rollbacks.inc();
                info!(snapshot = %snapshot.display(), "config rolled back, restarting gateway");
                self.issue_restart(RestartReason::ConfigRollback, epoch_now())
                    .await;
            }
            SafeguardEvent::Confirmed => self.metrics.confirms.inc(),
            SafeguardEvent::Armed { deadline, .. } => {
                debug!(deadline, "rollback window armed");
            }
            _ => {}
        }

        // ── Config backup (self rate-limited) ─────────────────────────────
        if let Some(ArchiveOutcome::Archived(_)) = self.backup.maybe_run(epoch_now()) {
            self.metrics.backups.inc();
        }

        // ── Housekeeping ──────────────────────────────────────────────────
        if self.tick_count % HOUSEKEEPING_TICKS == 0 {
            if let Err(e) = trim_log(&self.cfg.log_file(), self.cfg.max_log_lines) {
                warn!(error = %e, "log trim failed");
            }
            self.metrics.log_summary();
        }
    }

    // ─── Signal sampling ──────────────────────────────────────────────────

    async fn sample_signals(&mut self) -> TickSignals {
        let mut liveness = self.probes.process_alive(&self.cfg.process_pattern);
        if !liveness {
            // Fatal only when two probes 5 s apart agree; a restarting
            // gateway briefly vanishes from the table.
            tokio::time::sleep(LIVENESS_REPROBE).await;
            liveness = self.probes.process_alive(&self.cfg.process_pattern);
        }

        let http_healthy = match self
            .probes
            .http_status(&self.cfg.health_check_url, HTTP_TIMEOUT)
            .await
        {
            Some(code) => is_healthy_status(code),
            None => false,
        };

        let online = self
            .probes
            .ping(&self.cfg.ping_target, self.cfg.ping_timeout)
            .await;

        let proxy_ok = match &self.cfg.proxy_url {
            Some(proxy) if self.tick_count % self.cfg.proxy_check_interval == 0 => {
                Some(self.check_proxy(proxy).await)
            }
            _ => None,
        };

        TickSignals {
            liveness,
            http_healthy,
            online,
            proxy_ok,
            uptime_secs: self.probes.uptime_seconds(),
        }
    }

    /// Both legs must hold: the proxy socket accepts, and the LLM API
    /// answers through it with any parseable status.
    async fn check_proxy(&self, proxy: &str) -> bool {
        if !self
            .probes
            .proxy_socket_open(proxy, PROXY_SOCKET_TIMEOUT)
            .await
        {
            return false;
        }
        self.probes
            .http_status_via_proxy(&self.cfg.llm_api_check_url, proxy, PROXY_TIMEOUT)
            .await
            .is_some()
    }

    /// Fresh liveness + HTTP sample for the heartbeat and safeguard modules.
    async fn gateway_condition(&self) -> GatewayCondition {
        if !self.probes.process_alive(&self.cfg.process_pattern) {
            return GatewayCondition::Dead;
        }
        let healthy = match self
            .probes
            .http_status(&self.cfg.health_check_url, HTTP_TIMEOUT)
            .await
        {
            Some(code) => is_healthy_status(code),
            None => false,
        };
        if healthy {
            GatewayCondition::Healthy
        } else {
            GatewayCondition::Unresponsive
        }
    }

    // ─── Decision execution ───────────────────────────────────────────────

    async fn execute_decision(&mut self, decision: TickDecision) {
        match decision {
            TickDecision::Idle | TickDecision::NetworkDown => {}
            TickDecision::BackoffWaiting { remaining_secs } => {
                debug!(remaining_secs, "backoff ladder waiting");
            }
            TickDecision::RestartSuppressed { .. } => {
                self.metrics.restarts_suppressed.inc();
            }
            TickDecision::Restart { reason } => {
                self.issue_restart(reason, epoch_now()).await;
            }
            TickDecision::SettleThenVerify { trigger } => {
                debug!(?trigger, settle = self.cfg.tun_settle, "settling before verification");
                tokio::time::sleep(Duration::from_secs(self.cfg.tun_settle)).await;

                let online = self
                    .probes
                    .ping(&self.cfg.ping_target, self.cfg.ping_timeout)
                    .await;
                let external_reachable = self
                    .probes
                    .http_status(&self.cfg.discord_check_url, HTTP_TIMEOUT)
                    .await
                    == Some(200);

                match self
                    .engine
                    .resolve_settle(trigger, online, external_reachable, epoch_now())
                {
                    TickDecision::Restart { reason } => {
                        self.issue_restart(reason, epoch_now()).await;
                    }
                    TickDecision::RestartSuppressed { .. } => {
                        self.metrics.restarts_suppressed.inc();
                    }
                    _ => {}
                }
            }
        }
    }

    /// The single restart-issuing edge. Consults the cooldown, invokes the
    /// service manager, records the attempt unconditionally, then polls for
    /// recovery. Returns whether the gateway came back healthy.
    async fn issue_restart(&mut self, reason: RestartReason, now: u64) -> bool {
        if !self.engine.cooldown_allows(now) {
            warn!(reason = %reason, "restart suppressed by cooldown");
            self.metrics.restarts_suppressed.inc();
            return false;
        }

        warn!(reason = %reason, service = %self.cfg.service_label, "restarting gateway");
        self.metrics.restarts_issued.inc();
        if let Err(e) = self.probes.service_restart(&self.cfg.service_label) {
            error!(error = %e, "service restart invocation failed");
        }
        // Failed invocations count against the cooldown too; a storm of
        // failing restarts is still a storm.
        self.engine.record_restart(now);

        for attempt in 1..=POST_RESTART_POLLS {
            tokio::time::sleep(POST_RESTART_SPACING).await;
            if let Some(code) = self
                .probes
                .http_status(&self.cfg.health_check_url, HTTP_TIMEOUT)
                .await
            {
                if is_healthy_status(code) {
                    info!(attempt, "gateway healthy after restart");
                    return true;
                }
            }
        }
        warn!(reason = %reason, "gateway not healthy within post-restart window");
        false
    }

    pub fn metrics(&self) -> &OpsMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration as StdDuration;
    use warden_probes::ProbeResult;

    /// Scripted probes: fixed signal values plus a restart call counter.
    struct FakeProbes {
        alive: AtomicBool,
        http_code: AtomicU32, // 0 = unreachable
        online: AtomicBool,
        restarts: AtomicU32,
    }

    impl FakeProbes {
        fn healthy() -> Self {
            Self {
                alive: AtomicBool::new(true),
                http_code: AtomicU32::new(200),
                online: AtomicBool::new(true),
                restarts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GatewayProbes for FakeProbes {
        async fn ping(&self, _target: &str, _timeout_secs: u64) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn http_status(&self, _url: &str, _timeout: StdDuration) -> Option<u16> {
            match self.http_code.load(Ordering::SeqCst) {
                0 => None,
                c => Some(c as u16),
            }
        }

        async fn http_status_via_proxy(
            &self,
            _url: &str,
            _proxy: &str,
            _timeout: StdDuration,
        ) -> Option<u16> {
            None
        }

        async fn proxy_socket_open(&self, _proxy_url: &str, _timeout: StdDuration) -> bool {
            false
        }

        fn process_alive(&self, _pattern: &str) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn service_restart(&self, _label: &str) -> ProbeResult<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn uptime_seconds(&self) -> u64 {
            86_400
        }
    }

    fn test_config(state_dir: PathBuf) -> SupervisorConfig {
        SupervisorConfig {
            config_path: state_dir.join("gateway.json"),
            state_dir,
            tun_settle: 1,
            ..SupervisorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_tick_issues_no_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(dir.path().to_path_buf());
        let mut sup = Supervisor::new(cfg, FakeProbes::healthy());

        sup.tick().await;
        sup.tick().await;
        assert_eq!(sup.probes.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(sup.metrics().restarts_issued.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_gateway_restarts_once_then_cooldown_holds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(dir.path().to_path_buf());
        let probes = FakeProbes::healthy();
        probes.alive.store(false, Ordering::SeqCst);
        probes.http_code.store(0, Ordering::SeqCst);
        let mut sup = Supervisor::new(cfg, probes);

        sup.tick().await;
        assert_eq!(sup.probes.restarts.load(Ordering::SeqCst), 1);

        // Both ticks land inside the cooldown window: suppressed.
        sup.tick().await;
        sup.tick().await;
        assert_eq!(sup.probes.restarts.load(Ordering::SeqCst), 1);
        assert!(sup.metrics().restarts_suppressed.get() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn config_rollback_requests_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(dir.path().to_path_buf());
        std::fs::write(&cfg.config_path, b"v1").unwrap();

        let mut sup = Supervisor::new(cfg.clone(), FakeProbes::healthy());
        sup.safeguard = ConfigSafeguard::new(
            cfg.config_path.clone(),
            &cfg.state_dir,
            cfg.rollback_timeout,
            cfg.snapshot_retention,
        )
        .with_change_settle(StdDuration::ZERO);

        sup.tick().await; // bootstrap checksum
        std::fs::write(&cfg.config_path, b"v2").unwrap();
        sup.tick().await; // change detected, window armed
        assert!(sup.safeguard.armed().is_some());

        // Gateway turns unhealthy inside the window: rollback + restart.
        sup.probes.http_code.store(0, Ordering::SeqCst);
        sup.tick().await;
        assert!(sup.safeguard.armed().is_none());
        assert_eq!(sup.metrics().rollbacks.get(), 1);
        assert!(sup.probes.restarts.load(Ordering::SeqCst) >= 1);
    }
}
