//! OS capability surface for the warden supervisor.
//!
//! Everything platform-specific the supervision engine needs sits behind
//! [`GatewayProbes`]: ICMP echo, HTTP status probes (plain and proxied),
//! process-table lookup, service-manager restart, and system uptime. The
//! engine itself stays pure; the loop drives these probes and feeds the
//! results in.
//!
//! Every probe is bounded by an explicit per-call timeout and degrades to
//! "unhealthy"/"unknown" on failure; a probe never aborts a tick.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::process::Command;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// HTTP statuses accepted as healthy on the gateway health endpoint.
///
/// 401/403 prove the HTTP stack is alive even when auth is gated.
pub fn is_healthy_status(code: u16) -> bool {
    matches!(code, 200 | 204 | 401 | 403)
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("service control failed for {label}: {detail}")]
    ServiceControl { label: String, detail: String },
}

pub type ProbeResult<T> = Result<T, ProbeError>;

// ─── Capability trait ─────────────────────────────────────────────────────────

/// The platform operations the tick loop needs. Implemented for the live
/// system by [`SystemProbes`]; tests substitute their own.
#[async_trait]
pub trait GatewayProbes: Send + Sync {
    /// One ICMP echo to `target`; true when a reply arrives within `timeout_secs`.
    async fn ping(&self, target: &str, timeout_secs: u64) -> bool;

    /// HTTP GET returning the response status, or `None` on any failure
    /// (timeout, connection refused, DNS).
    async fn http_status(&self, url: &str, timeout: Duration) -> Option<u16>;

    /// HTTP GET through `proxy`, returning the status or `None`.
    async fn http_status_via_proxy(
        &self,
        url: &str,
        proxy: &str,
        timeout: Duration,
    ) -> Option<u16>;

    /// TCP connect to the host:port of `proxy_url` within `timeout`.
    async fn proxy_socket_open(&self, proxy_url: &str, timeout: Duration) -> bool;

    /// Is a process matching `pattern` visible in the OS process table?
    fn process_alive(&self, pattern: &str) -> bool;

    /// Restart the managed gateway by its service-manager label.
    fn service_restart(&self, label: &str) -> ProbeResult<()>;

    /// Monotonic system uptime in seconds.
    fn uptime_seconds(&self) -> u64;
}

// ─── Live implementation ──────────────────────────────────────────────────────

/// Probes backed by the real host: `ping(8)`, reqwest, sysinfo, and the
/// user-scope service manager.
pub struct SystemProbes {
    client: reqwest::Client,
}

impl SystemProbes {
    pub fn new() -> Self {
        // Per-request timeouts are set at each call site; the client itself
        // carries no global deadline.
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SystemProbes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayProbes for SystemProbes {
    async fn ping(&self, target: &str, timeout_secs: u64) -> bool {
        // ping's own -W/-t flag bounds the wait; the outer timeout is a
        // backstop in case the binary itself wedges.
        let target = target.to_string();
        let out = tokio::time::timeout(
            Duration::from_secs(timeout_secs + 2),
            tokio::task::spawn_blocking(move || ping_command(&target, timeout_secs).output()),
        )
        .await;
        match out {
            Ok(Ok(Ok(o))) => o.status.success(),
            _ => false,
        }
    }

    async fn http_status(&self, url: &str, timeout: Duration) -> Option<u16> {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                debug!(url, error = %e, "http probe failed");
                None
            }
        }
    }

    async fn http_status_via_proxy(
        &self,
        url: &str,
        proxy: &str,
        timeout: Duration,
    ) -> Option<u16> {
        let proxy = match reqwest::Proxy::all(proxy) {
            Ok(p) => p,
            Err(e) => {
                warn!(proxy, error = %e, "invalid proxy url");
                return None;
            }
        };
        let client = match reqwest::Client::builder().proxy(proxy).timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build proxied client");
                return None;
            }
        };
        match client.get(url).send().await {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                debug!(url, error = %e, "proxied http probe failed");
                None
            }
        }
    }

    async fn proxy_socket_open(&self, proxy_url: &str, timeout: Duration) -> bool {
        let Some((host, port)) = proxy_host_port(proxy_url) else {
            warn!(proxy = proxy_url, "cannot extract host:port from proxy url");
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await,
            Ok(Ok(_))
        )
    }

    fn process_alive(&self, pattern: &str) -> bool {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes().values().any(|p| {
            p.name().to_string_lossy().contains(pattern)
                || p.cmd()
                    .iter()
                    .any(|arg| arg.to_string_lossy().contains(pattern))
        })
    }

    fn service_restart(&self, label: &str) -> ProbeResult<()> {
        let output = service_restart_command(label)
            .output()
            .map_err(|e| ProbeError::ServiceControl {
                label: label.to_string(),
                detail: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProbeError::ServiceControl {
                label: label.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn uptime_seconds(&self) -> u64 {
        System::uptime()
    }
}

// ─── Platform command construction ────────────────────────────────────────────

#[cfg(target_os = "macos")]
fn ping_command(target: &str, timeout_secs: u64) -> Command {
    let mut cmd = Command::new("ping");
    cmd.args(["-c", "1", "-t", &timeout_secs.to_string(), target]);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn ping_command(target: &str, timeout_secs: u64) -> Command {
    let mut cmd = Command::new("ping");
    cmd.args(["-c", "1", "-W", &timeout_secs.to_string(), target]);
    cmd
}

#[cfg(target_os = "macos")]
fn service_restart_command(label: &str) -> Command {
    // kickstart -k kills a running instance first, which forces the service
    // manager to relaunch even a wedged-but-alive gateway.
    let uid = Command::new("id")
        .arg("-u")
        .output()
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "501".to_string());
    let mut cmd = Command::new("launchctl");
    cmd.args(["kickstart", "-k", &format!("gui/{uid}/{label}")]);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn service_restart_command(label: &str) -> Command {
    let mut cmd = Command::new("systemctl");
    cmd.args(["--user", "restart", label]);
    cmd
}

/// Host and port of a proxy URL, with scheme-appropriate default ports.
pub fn proxy_host_port(proxy_url: &str) -> Option<(String, u16)> {
    let parsed = url::Url::parse(proxy_url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default().or(match parsed.scheme() {
        "socks5" | "socks5h" => Some(1080),
        _ => None,
    })?;
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_statuses_include_auth_gates() {
        assert!(is_healthy_status(200));
        assert!(is_healthy_status(204));
        assert!(is_healthy_status(401));
        assert!(is_healthy_status(403));
    }

    #[test]
    fn unhealthy_statuses_rejected() {
        assert!(!is_healthy_status(500));
        assert!(!is_healthy_status(502));
        assert!(!is_healthy_status(404));
        assert!(!is_healthy_status(301));
    }

    #[test]
    fn proxy_host_port_explicit() {
        assert_eq!(
            proxy_host_port("http://127.0.0.1:7890"),
            Some(("127.0.0.1".to_string(), 7890))
        );
    }

    #[test]
    fn proxy_host_port_default_ports() {
        assert_eq!(
            proxy_host_port("http://proxy.local"),
            Some(("proxy.local".to_string(), 80))
        );
        assert_eq!(
            proxy_host_port("socks5://127.0.0.1"),
            Some(("127.0.0.1".to_string(), 1080))
        );
    }

    #[test]
    fn proxy_host_port_garbage_is_none() {
        assert_eq!(proxy_host_port("not a url"), None);
    }

    #[test]
    fn process_alive_unmatched_pattern() {
        let probes = SystemProbes::new();
        assert!(!probes.process_alive("warden-no-such-process-zzz"));
    }

    #[test]
    fn uptime_is_positive() {
        let probes = SystemProbes::new();
        assert!(probes.uptime_seconds() > 0);
    }
}
