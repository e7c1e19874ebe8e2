//! Supervisor configuration: a key=value file layered over defaults.
//!
//! The file is sourced as shell-like assignments (`KEY=value`, `#` comments,
//! optional `export` prefix, optional quoting) so the same file can be read
//! by shell tooling around the supervisor. Every recognized key has a
//! default; unknown keys warn and are ignored, malformed values warn and keep
//! the default. The struct is immutable after load.

use std::path::{Path, PathBuf};
use tracing::warn;

/// Immutable runtime parameters for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    // Tick and control
    pub check_interval: u64,
    pub cooldown: u64,
    pub backoff_initial: u64,
    pub backoff_max: u64,
    pub backoff_multiplier: f64,

    // Probe endpoints
    pub health_check_url: String,
    pub ping_target: String,
    pub ping_timeout: u64,
    pub discord_check_url: String,
    pub proxy_url: Option<String>,
    pub llm_api_check_url: String,
    /// Proxy is sampled every this-many ticks.
    pub proxy_check_interval: u64,
    pub proxy_fail_threshold: u32,
    /// Settle delay (seconds) after wake or network recovery.
    pub tun_settle: u64,

    // Agent heartbeat
    pub heartbeat_check_interval: u64,
    pub heartbeat_threshold_min: i64,
    /// Raw `name:path` pairs, space separated.
    pub agent_workspaces: String,

    // Config safeguard
    pub config_path: PathBuf,
    pub rollback_timeout: u64,
    pub snapshot_retention: usize,

    // Process control
    pub service_label: String,
    pub process_pattern: String,

    // Housekeeping
    pub max_log_lines: usize,
    pub state_dir: PathBuf,
    pub backup_interval: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: 15,
            cooldown: 300,
            backoff_initial: 30,
            backoff_max: 300,
            backoff_multiplier: 2.0,

            health_check_url: "http://127.0.0.1:18789/health".to_string(),
            ping_target: "1.1.1.1".to_string(),
            ping_timeout: 3,
            discord_check_url: "https://discord.com/api/v10/gateway".to_string(),
            proxy_url: None,
            llm_api_check_url: "https://api.anthropic.com/v1/models".to_string(),
            proxy_check_interval: 4,
            proxy_fail_threshold: 3,
            tun_settle: 20,

            heartbeat_check_interval: 600,
            heartbeat_threshold_min: 120,
            agent_workspaces: String::new(),

            config_path: expand_tilde("~/.openclaw/openclaw.json"),
            rollback_timeout: 300,
            snapshot_retention: 10,

            service_label: "ai.openclaw.gateway".to_string(),
            process_pattern: "openclaw-gateway".to_string(),

            max_log_lines: 10_000,
            state_dir: expand_tilde("~/.warden"),
            backup_interval: 3600,
        }
    }
}

impl SupervisorConfig {
    /// Load from a key=value file, layering over defaults. A missing file
    /// yields pure defaults; a malformed line or unknown key warns and is
    /// skipped.
    pub fn load(path: &Path) -> Self {
        let mut cfg = Self::default();
        let Ok(contents) = std::fs::read_to_string(path) else {
            return cfg;
        };
        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = raw, "ignoring malformed config line");
                continue;
            };
            cfg.apply(key.trim(), unquote(value.trim()));
        }
        cfg
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "CHECK_INTERVAL" => set_u64(key, value, &mut self.check_interval),
            "COOLDOWN" => set_u64(key, value, &mut self.cooldown),
            "BACKOFF_INITIAL" => set_u64(key, value, &mut self.backoff_initial),
            "BACKOFF_MAX" => set_u64(key, value, &mut self.backoff_max),
            "BACKOFF_MULTIPLIER" => match value.parse::<f64>() {
                Ok(v) if v > 1.0 => self.backoff_multiplier = v,
                _ => warn!(key, value, "invalid multiplier, keeping default"),
            },

            "HEALTH_CHECK_URL" => self.health_check_url = value.to_string(),
            "PING_TARGET" => self.ping_target = value.to_string(),
            "PING_TIMEOUT" => set_u64(key, value, &mut self.ping_timeout),
            "DISCORD_CHECK_URL" => self.discord_check_url = value.to_string(),
            "PROXY_URL" => {
                self.proxy_url = (!value.is_empty()).then(|| value.to_string());
            }
            "LLM_API_CHECK_URL" => self.llm_api_check_url = value.to_string(),
            "PROXY_CHECK_INTERVAL" => set_u64(key, value, &mut self.proxy_check_interval),
            "PROXY_FAIL_THRESHOLD" => match value.parse::<u32>() {
                Ok(v) if v > 0 => self.proxy_fail_threshold = v,
                _ => warn!(key, value, "invalid threshold, keeping default"),
            },
            "TUN_SETTLE" => set_u64(key, value, &mut self.tun_settle),

            "HEARTBEAT_CHECK_INTERVAL" => set_u64(key, value, &mut self.heartbeat_check_interval),
            "HEARTBEAT_THRESHOLD_MIN" => match value.parse::<i64>() {
                Ok(v) if v > 0 => self.heartbeat_threshold_min = v,
                _ => warn!(key, value, "invalid threshold, keeping default"),
            },
            "AGENT_WORKSPACES" => self.agent_workspaces = value.to_string(),

            "CONFIG_PATH" => self.config_path = expand_tilde(value),
            "ROLLBACK_TIMEOUT" => set_u64(key, value, &mut self.rollback_timeout),
            "SNAPSHOT_RETENTION" => match value.parse::<usize>() {
                Ok(v) if v > 0 => self.snapshot_retention = v,
                _ => warn!(key, value, "invalid retention, keeping default"),
            },

            "SERVICE_LABEL" => self.service_label = value.to_string(),
            "PROCESS_PATTERN" => self.process_pattern = value.to_string(),

            "MAX_LOG_LINES" => match value.parse::<usize>() {
                Ok(v) if v > 0 => self.max_log_lines = v,
                _ => warn!(key, value, "invalid log limit, keeping default"),
            },
            "STATE_DIR" => self.state_dir = expand_tilde(value),
            "BACKUP_INTERVAL" => set_u64(key, value, &mut self.backup_interval),

            _ => warn!(key, "unknown config key ignored"),
        }
    }

    // ─── Derived paths ────────────────────────────────────────────────────

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("watchdog.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("warden.log")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }
}

fn set_u64(key: &str, value: &str, slot: &mut u64) {
    match value.parse::<u64>() {
        Ok(v) if v > 0 => *slot = v,
        _ => warn!(key, value, "invalid value, keeping default"),
    }
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')))
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
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

/// Default location of the supervisor's own config file.
pub fn default_config_file() -> PathBuf {
    expand_tilde("~/.warden/warden.conf")
}
