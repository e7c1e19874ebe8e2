//! Gateway health classification for the warden supervisor.
//!
//! [`GatewayHealthEngine`] is a pure state machine: it consumes one
//! [`TickSignals`] snapshot plus the current epoch and returns exactly one
//! [`TickDecision`] the caller executes. No I/O, no clock access; the loop
//! (or a test) owns both, which is what lets the engine be driven against
//! synthetic signal traces.
//!
//! Decision priority within a tick: wake detection, network transition,
//! network-down short-circuit, fatal/transient process health, proxy health.
//! At most one restart is ever authorized per tick, and every authorized
//! restart passes the cooldown gate first.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

// ─── Policy ───────────────────────────────────────────────────────────────────

/// Tunables for the classifier. Loaded once from supervisor config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Tick period in seconds; wake detection treats an uptime jump larger
    /// than ten ticks as a suspend/resume.
    pub check_interval: u64,
    /// Minimum wall-clock seconds between authorized restarts.
    pub cooldown: u64,
    /// First backoff wait in seconds.
    pub backoff_initial: u64,
    /// Ceiling for the backoff ladder; the escalation that would exceed it
    /// authorizes a restart instead.
    pub backoff_max: u64,
    /// Ladder growth factor.
    pub backoff_multiplier: f64,
    /// Consecutive failed proxy checks before a restart is authorized.
    pub proxy_fail_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            check_interval: 15,
            cooldown: 300,
            backoff_initial: 30,
            backoff_max: 300,
            backoff_multiplier: 2.0,
            proxy_fail_threshold: 3,
        }
    }
}

// ─── Signals ──────────────────────────────────────────────────────────────────

/// One tick's worth of freshly sampled signals.
///
/// `liveness` is expected to be double-probed by the caller (two 5 s probes)
/// before it reports false. `proxy_ok` is `None` on ticks where the proxy was
/// not sampled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickSignals {
    pub liveness: bool,
    pub http_healthy: bool,
    pub online: bool,
    pub proxy_ok: Option<bool>,
    pub uptime_secs: u64,
}

impl TickSignals {
    /// A fully healthy sample, useful as a test baseline.
    pub fn healthy(uptime_secs: u64) -> Self {
        Self {
            liveness: true,
            http_healthy: true,
            online: true,
            proxy_ok: None,
            uptime_secs,
        }
    }
}

// ─── Decisions ────────────────────────────────────────────────────────────────

/// Why a restart was (or would have been) issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartReason {
    GatewayDead,
    BackoffExhausted,
    NetworkRecovered,
    WakeRecovered,
    ProxyDegraded,
    ConfigRollback,
    AgentsStaleGatewayDead,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GatewayDead => "gateway-dead",
            Self::BackoffExhausted => "backoff-exhausted",
            Self::NetworkRecovered => "network-recovered",
            Self::WakeRecovered => "wake-recovered",
            Self::ProxyDegraded => "proxy-degraded",
            Self::ConfigRollback => "config-rollback",
            Self::AgentsStaleGatewayDead => "agents-stale-gateway-dead",
        };
        f.write_str(s)
    }
}

/// Condition that demands a settle delay and re-verification before the
/// engine will commit to a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleTrigger {
    WakeDetected,
    NetworkRecovered,
}

/// What the caller must do after [`GatewayHealthEngine::observe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickDecision {
    /// Nothing to do.
    Idle,
    /// Network is down; skip the remaining checks this tick and never restart.
    NetworkDown,
    /// Sleep the settle interval, re-probe `online`/`external_reachable`,
    /// then call [`GatewayHealthEngine::resolve_settle`].
    SettleThenVerify { trigger: SettleTrigger },
    /// Backoff ladder armed; re-evaluate next tick.
    BackoffWaiting { remaining_secs: u64 },
    /// Restart authorized (cooldown already consulted).
    Restart { reason: RestartReason },
    /// A restart was warranted but the cooldown suppressed it. Per-class
    /// counters are left untouched; the condition stays armed.
    RestartSuppressed {
        reason: RestartReason,
        remaining_cooldown: u64,
    },
}

// ─── Component state ──────────────────────────────────────────────────────────

/// Escalating wait ladder for the transient-unhealthy class.
/// `wait_secs == 0` means inactive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    pub wait_secs: u64,
    pub fail_start: u64,
}

impl BackoffState {
    pub fn active(&self) -> bool {
        self.wait_secs > 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Global anti-thrash guard. `last_restart == 0` means no restart yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownState {
    pub last_restart: u64,
}

impl CooldownState {
    pub fn allows(&self, now: u64, cooldown: u64) -> bool {
        self.last_restart == 0 || now.saturating_sub(self.last_restart) >= cooldown
    }

    pub fn remaining(&self, now: u64, cooldown: u64) -> u64 {
        if self.last_restart == 0 {
            0
        } else {
            cooldown.saturating_sub(now.saturating_sub(self.last_restart))
        }
    }

    /// Record an invocation. Failed restarts count too; storms are
    /// throttled regardless of outcome.
    pub fn record(&mut self, now: u64) {
        self.last_restart = self.last_restart.max(now);
    }
}

/// Detects suspend/resume and reboot by watching system uptime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WakeState {
    last_uptime_secs: Option<u64>,
}

impl WakeState {
    /// Feed the current uptime; true exactly once per wake event.
    /// An uptime decrease (reboot) and a jump of more than ten ticks
    /// (resume after sleep) are treated identically.
    pub fn observe(&mut self, uptime_secs: u64, check_interval: u64) -> bool {
        let woke = match self.last_uptime_secs {
            Some(last) => uptime_secs < last || uptime_secs > last + check_interval * 10,
            None => false,
        };
        self.last_uptime_secs = Some(uptime_secs);
        woke
    }
}

/// Edge-triggered connectivity state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub was_down: bool,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// The decision core: one instance per supervised gateway, fed every tick.
#[derive(Debug)]
pub struct GatewayHealthEngine {
    policy: HealthPolicy,
    backoff: BackoffState,
    cooldown: CooldownState,
    wake: WakeState,
    network: NetworkState,
    proxy_fails: u32,
}

impl GatewayHealthEngine {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            backoff: BackoffState::default(),
            cooldown: CooldownState::default(),
            wake: WakeState::default(),
            network: NetworkState::default(),
            proxy_fails: 0,
        }
    }

    pub fn backoff(&self) -> BackoffState {
        self.backoff
    }

    pub fn consecutive_proxy_failures(&self) -> u32 {
        self.proxy_fails
    }

    pub fn network_was_down(&self) -> bool {
        self.network.was_down
    }

    /// Is a restart currently permitted by the cooldown gate?
    pub fn cooldown_allows(&self, now: u64) -> bool {
        self.cooldown.allows(now, self.policy.cooldown)
    }

    /// Record a restart invocation. Called unconditionally after the control
    /// primitive is issued, success or not.
    pub fn record_restart(&mut self, now: u64) {
        self.cooldown.record(now);
    }

    /// Classify one tick. Exactly one decision comes back; the caller
    /// executes it.
    pub fn observe(&mut self, signals: &TickSignals, now: u64) -> TickDecision {
        // 1. Wake check. A machine that just resumed has stale sockets and
        //    a possibly confused gateway; verify before anything else.
        if self.wake.observe(signals.uptime_secs, self.policy.check_interval) {
            info!(uptime = signals.uptime_secs, "wake detected, settling before verification");
            return TickDecision::SettleThenVerify {
                trigger: SettleTrigger::WakeDetected,
            };
        }

        // 2/3. Network gating. While offline, restarting cannot help and the
        //      remaining signals are meaningless.
        if !signals.online {
            if !self.network.was_down {
                warn!("network down, suspending health classification");
            }
            self.network.was_down = true;
            return TickDecision::NetworkDown;
        }
        if self.network.was_down {
            info!("network recovered, settling before verification");
            return TickDecision::SettleThenVerify {
                trigger: SettleTrigger::NetworkRecovered,
            };
        }

        // 4. Fatal / transient classification.
        if !signals.liveness {
            warn!("gateway process not found");
            return self.authorize(RestartReason::GatewayDead, now);
        }
        if !signals.http_healthy {
            return self.advance_backoff(now);
        }
        if self.backoff.active() {
            info!("gateway healthy again, backoff ladder reset");
        }
        self.backoff.reset();

        // 5. Proxy health (sampled every K ticks by the caller).
        match signals.proxy_ok {
            Some(true) => {
                self.proxy_fails = 0;
                TickDecision::Idle
            }
            Some(false) => {
                self.proxy_fails += 1;
                warn!(
                    consecutive = self.proxy_fails,
                    threshold = self.policy.proxy_fail_threshold,
                    "proxy check failed"
                );
                if self.proxy_fails >= self.policy.proxy_fail_threshold {
                    self.authorize(RestartReason::ProxyDegraded, now)
                } else {
                    TickDecision::Idle
                }
            }
            None => TickDecision::Idle,
        }
    }

    /// Complete a [`TickDecision::SettleThenVerify`] with re-probed signals.
    pub fn resolve_settle(
        &mut self,
        trigger: SettleTrigger,
        online: bool,
        external_reachable: bool,
        now: u64,
    ) -> TickDecision {
        match trigger {
            SettleTrigger::WakeDetected => {
                if online {
                    self.authorize(RestartReason::WakeRecovered, now)
                } else {
                    // Still offline: the network-down path takes over on the
                    // next tick. The wake signal is one-shot.
                    debug!("offline after wake settle, deferring");
                    TickDecision::Idle
                }
            }
            SettleTrigger::NetworkRecovered => {
                if online && external_reachable {
                    let decision = self.authorize(RestartReason::NetworkRecovered, now);
                    if matches!(decision, TickDecision::Restart { .. }) {
                        self.network.was_down = false;
                    }
                    decision
                } else {
                    // Not actually settled; keep was_down so the next tick
                    // re-enters the recovery path.
                    debug!(online, external_reachable, "recovery not confirmed, deferring");
                    TickDecision::Idle
                }
            }
        }
    }

    /// Gate a warranted restart through the cooldown. Authorized restarts
    /// reset the per-class counters; suppressed ones leave everything armed.
    fn authorize(&mut self, reason: RestartReason, now: u64) -> TickDecision {
        if !self.cooldown.allows(now, self.policy.cooldown) {
            let remaining = self.cooldown.remaining(now, self.policy.cooldown);
            warn!(reason = %reason, remaining, "restart suppressed by cooldown");
            return TickDecision::RestartSuppressed {
                reason,
                remaining_cooldown: remaining,
            };
        }
        self.backoff.reset();
        self.proxy_fails = 0;
        TickDecision::Restart { reason }
    }

    /// Advance the transient-unhealthy ladder by one tick.
    fn advance_backoff(&mut self, now: u64) -> TickDecision {
        if !self.backoff.active() {
            self.backoff.wait_secs = self.policy.backoff_initial;
            self.backoff.fail_start = now;
            warn!(
                wait = self.backoff.wait_secs,
                "gateway unhealthy, entering backoff"
            );
            return TickDecision::BackoffWaiting {
                remaining_secs: self.backoff.wait_secs,
            };
        }

        let elapsed = now.saturating_sub(self.backoff.fail_start);
        if elapsed < self.backoff.wait_secs {
            return TickDecision::BackoffWaiting {
                remaining_secs: self.backoff.wait_secs - elapsed,
            };
        }

        // Wait expired and this tick's fresh signals still say unhealthy.
        let next = (self.backoff.wait_secs as f64 * self.policy.backoff_multiplier) as u64;
        if next > self.policy.backoff_max {
            warn!(
                next,
                max = self.policy.backoff_max,
                "backoff ladder exhausted"
            );
            return self.authorize(RestartReason::BackoffExhausted, now);
        }
        self.backoff.wait_secs = next;
        self.backoff.fail_start = now;
        warn!(wait = next, "gateway still unhealthy, backoff escalated");
        TickDecision::BackoffWaiting {
            remaining_secs: next,
        }
    }
}
