//! Agent staleness probe: catches the "process alive, scheduler dead" mode.
//!
//! Each configured agent workspace carries a heartbeat timestamp file the
//! agent refreshes while its scheduler is running. When every signal on the
//! gateway looks fine but heartbeats stop advancing, the scheduler inside the
//! gateway has wedged, a state no process-table or HTTP probe can see.
//!
//! This module never initiates a restart for a healthy gateway; it only
//! escalates when liveness already says the gateway is gone.

#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Heartbeat file location inside each agent workspace.
pub const HEARTBEAT_FILE: &str = "state/last-heartbeat";

// ─── Workspace configuration ──────────────────────────────────────────────────

/// One supervised agent: display name plus its workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWorkspace {
    pub name: String,
    pub dir: PathBuf,
}

impl AgentWorkspace {
    pub fn heartbeat_path(&self) -> PathBuf {
        self.dir.join(HEARTBEAT_FILE)
    }
}

/// Parse the `AGENT_WORKSPACES` setting: space-separated `name:path` pairs,
/// `~` expanded to the home directory. Malformed entries are skipped with a
/// warning rather than failing the whole config.
pub fn parse_workspaces(raw: &str) -> Vec<AgentWorkspace> {
    raw.split_whitespace()
        .filter_map(|entry| match entry.split_once(':') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => Some(AgentWorkspace {
                name: name.to_string(),
                dir: expand_tilde(path),
            }),
            _ => {
                warn!(entry, "ignoring malformed agent workspace entry");
                None
            }
        })
        .collect()
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ─── Timestamp parsing ────────────────────────────────────────────────────────

/// Parse an ISO-8601-like heartbeat timestamp. A missing offset means UTC.
pub fn parse_heartbeat(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

// ─── Sweep results ────────────────────────────────────────────────────────────

/// Gateway condition as observed by the caller right before the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayCondition {
    /// Process missing from the table.
    Dead,
    /// Process alive but the health endpoint is failing.
    Unresponsive,
    /// Process alive and HTTP healthy.
    Healthy,
}

/// Per-agent outcome of one sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    /// Minutes since the last heartbeat; `None` when the file was missing or
    /// unparseable.
    pub minutes_stale: Option<i64>,
    pub stale: bool,
    pub error: Option<String>,
}

/// What the sweep asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatAction {
    /// All agents fresh (or none configured).
    AllFresh,
    /// Stale agents and the gateway is dead: request a restart
    /// (reason `agents-stale-gateway-dead`, cooldown applies at the edge).
    RequestRestart,
    /// Stale agents but the health module already owns this failure.
    DeferToHealth,
    /// Stale agents under a fully healthy gateway: likely internal scheduler
    /// failure; restart remains a manual call.
    WarnSchedulerSuspect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub agents: Vec<AgentStatus>,
    pub action: HeartbeatAction,
}

impl SweepReport {
    pub fn stale_count(&self) -> usize {
        self.agents.iter().filter(|a| a.stale).count()
    }
}

// ─── Monitor ──────────────────────────────────────────────────────────────────

/// Rate-limited heartbeat sweeper.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    agents: Vec<AgentWorkspace>,
    check_interval_secs: i64,
    threshold_min: i64,
    last_run: Option<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    pub fn new(agents: Vec<AgentWorkspace>, check_interval_secs: u64, threshold_min: i64) -> Self {
        Self {
            agents,
            check_interval_secs: check_interval_secs as i64,
            threshold_min,
            last_run: None,
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Has the rate-limit interval elapsed since the last sweep?
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.check_interval_secs,
        }
    }

    /// Run one sweep. Returns `None` when rate-limited or no agents are
    /// configured.
    pub fn sweep(&mut self, now: DateTime<Utc>, gateway: GatewayCondition) -> Option<SweepReport> {
        if self.agents.is_empty() || !self.due(now) {
            return None;
        }
        self.last_run = Some(now);

        let agents: Vec<AgentStatus> = self
            .agents
            .iter()
            .map(|ws| self.check_agent(ws, now))
            .collect();

        let any_stale = agents.iter().any(|a| a.stale);
        let action = if !any_stale {
            HeartbeatAction::AllFresh
        } else {
            match gateway {
                GatewayCondition::Dead => {
                    warn!(
                        stale = agents.iter().filter(|a| a.stale).count(),
                        "stale agents and gateway process is dead, requesting restart"
                    );
                    HeartbeatAction::RequestRestart
                }
                GatewayCondition::Unresponsive => {
                    info!("stale agents under unresponsive gateway, health backoff owns this");
                    HeartbeatAction::DeferToHealth
                }
                GatewayCondition::Healthy => {
                    warn!(
                        "stale agents under healthy gateway, scheduler failure suspected; \
                         not restarting"
                    );
                    HeartbeatAction::WarnSchedulerSuspect
                }
            }
        };

        Some(SweepReport { agents, action })
    }

    fn check_agent(&self, ws: &AgentWorkspace, now: DateTime<Utc>) -> AgentStatus {
        let path = ws.heartbeat_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                debug!(agent = %ws.name, path = %path.display(), error = %e, "heartbeat file unreadable");
                return AgentStatus {
                    name: ws.name.clone(),
                    minutes_stale: None,
                    stale: false,
                    error: Some(format!("unreadable: {e}")),
                };
            }
        };

        let Some(last) = parse_heartbeat(&raw) else {
            warn!(agent = %ws.name, "unparseable heartbeat timestamp");
            return AgentStatus {
                name: ws.name.clone(),
                minutes_stale: None,
                stale: false,
                error: Some("unparseable timestamp".to_string()),
            };
        };

        let minutes = (now - last).num_minutes();
        let stale = minutes > self.threshold_min;
        if stale {
            warn!(agent = %ws.name, minutes, threshold = self.threshold_min, "agent heartbeat stale");
        } else {
            debug!(agent = %ws.name, minutes, "agent heartbeat fresh");
        }
        AgentStatus {
            name: ws.name.clone(),
            minutes_stale: Some(minutes),
            stale,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs;
    use std::path::Path;

    fn workspace_with_heartbeat(dir: &Path, name: &str, stamp: &str) -> AgentWorkspace {
        let ws_dir = dir.join(name);
        fs::create_dir_all(ws_dir.join("state")).expect("mkdir");
        fs::write(ws_dir.join(HEARTBEAT_FILE), stamp).expect("write heartbeat");
        AgentWorkspace {
            name: name.to_string(),
            dir: ws_dir,
        }
    }

    #[test]
    fn parse_rfc3339_with_offset() {
        let dt = parse_heartbeat("2026-03-01T12:30:00+02:00").expect("parse");
        assert_eq!(dt.to_rfc3339(), "2026-03-01T10:30:00+00:00");
    }

    #[test]
    fn parse_without_offset_is_utc() {
        let dt = parse_heartbeat("2026-03-01T12:30:00").expect("parse");
        assert_eq!(dt.to_rfc3339(), "2026-03-01T12:30:00+00:00");
    }

    #[test]
    fn parse_space_separated_and_fractional() {
        assert!(parse_heartbeat("2026-03-01 12:30:00").is_some());
        assert!(parse_heartbeat("2026-03-01T12:30:00.123456").is_some());
        assert!(parse_heartbeat("2026-03-01T12:30:00Z").is_some());
    }

    #[test]
    fn parse_garbage_is_none() {
        assert!(parse_heartbeat("yesterday-ish").is_none());
        assert!(parse_heartbeat("").is_none());
    }

    #[test]
    fn parse_workspaces_splits_pairs() {
        let ws = parse_workspaces("planner:/srv/agents/planner coder:/srv/agents/coder");
        assert_eq!(ws.len(), 2);
        assert_eq!(ws[0].name, "planner");
        assert_eq!(ws[1].dir, PathBuf::from("/srv/agents/coder"));
    }

    #[test]
    fn parse_workspaces_skips_malformed() {
        let ws = parse_workspaces("good:/tmp/a nocolon :nopath");
        assert_eq!(ws.len(), 1);
        assert_eq!(ws[0].name, "good");
    }

    #[test]
    fn fresh_agents_report_all_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let ws = workspace_with_heartbeat(dir.path(), "a1", &now.to_rfc3339());

        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        let report = mon.sweep(now, GatewayCondition::Healthy).expect("sweep");
        assert_eq!(report.action, HeartbeatAction::AllFresh);
        assert_eq!(report.stale_count(), 0);
    }

    #[test]
    fn stale_agent_with_dead_gateway_requests_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let old = (now - Duration::minutes(180)).to_rfc3339();
        let ws = workspace_with_heartbeat(dir.path(), "a1", &old);

        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        let report = mon.sweep(now, GatewayCondition::Dead).expect("sweep");
        assert_eq!(report.action, HeartbeatAction::RequestRestart);
        assert_eq!(report.stale_count(), 1);
        assert_eq!(report.agents[0].minutes_stale, Some(180));
    }

    #[test]
    fn stale_agent_with_healthy_gateway_only_warns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let old = (now - Duration::minutes(180)).to_rfc3339();
        let ws = workspace_with_heartbeat(dir.path(), "a1", &old);

        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        let report = mon.sweep(now, GatewayCondition::Healthy).expect("sweep");
        assert_eq!(report.action, HeartbeatAction::WarnSchedulerSuspect);
    }

    #[test]
    fn stale_agent_with_unresponsive_gateway_defers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let old = (now - Duration::minutes(121)).to_rfc3339();
        let ws = workspace_with_heartbeat(dir.path(), "a1", &old);

        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        let report = mon.sweep(now, GatewayCondition::Unresponsive).expect("sweep");
        assert_eq!(report.action, HeartbeatAction::DeferToHealth);
    }

    #[test]
    fn exactly_at_threshold_is_not_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let at = (now - Duration::minutes(120)).to_rfc3339();
        let ws = workspace_with_heartbeat(dir.path(), "a1", &at);

        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        let report = mon.sweep(now, GatewayCondition::Healthy).expect("sweep");
        assert_eq!(report.action, HeartbeatAction::AllFresh);
    }

    #[test]
    fn missing_heartbeat_file_is_error_not_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = AgentWorkspace {
            name: "ghost".to_string(),
            dir: dir.path().join("ghost"),
        };
        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        let report = mon.sweep(Utc::now(), GatewayCondition::Dead).expect("sweep");
        assert_eq!(report.action, HeartbeatAction::AllFresh);
        assert!(report.agents[0].error.is_some());
    }

    #[test]
    fn sweep_is_rate_limited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let ws = workspace_with_heartbeat(dir.path(), "a1", &now.to_rfc3339());

        let mut mon = HeartbeatMonitor::new(vec![ws], 600, 120);
        assert!(mon.sweep(now, GatewayCondition::Healthy).is_some());
        assert!(mon.sweep(now + Duration::seconds(300), GatewayCondition::Healthy).is_none());
        assert!(mon.sweep(now + Duration::seconds(600), GatewayCondition::Healthy).is_some());
    }

    #[test]
    fn no_agents_means_no_sweep() {
        let mut mon = HeartbeatMonitor::new(vec![], 600, 120);
        assert!(mon.sweep(Utc::now(), GatewayCondition::Healthy).is_none());
    }
}
