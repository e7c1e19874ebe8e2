//! Human-readable `status` output: supervisor, gateway, safeguard, backup.

use crate::backup::{Archiver, FileHistoryArchiver};
use crate::config::SupervisorConfig;
use crate::epoch_now;
use std::time::Duration;
use warden_persist::PidFile;
use warden_probes::{is_healthy_status, GatewayProbes, SystemProbes};
use warden_safeguard::ConfigSafeguard;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe everything once and print the status sections.
pub async fn print_status(cfg: &SupervisorConfig) {
    let probes = SystemProbes::new();

    // ── Supervisor ────────────────────────────────────────────────────────
    println!("Supervisor:");
    let pid_file = PidFile::new(cfg.pid_file());
    match pid_file.live_pid() {
        Some(pid) => println!("  running:    yes (pid {pid})"),
        None => println!("  running:    no"),
    }
    println!("  state dir:  {}", cfg.state_dir.display());
    println!();

    // ── Gateway ───────────────────────────────────────────────────────────
    println!("Gateway:");
    let alive = probes.process_alive(&cfg.process_pattern);
    println!(
        "  process:    {} ({})",
        if alive { "running" } else { "not found" },
        cfg.process_pattern
    );
    match probes.http_status(&cfg.health_check_url, HTTP_TIMEOUT).await {
        Some(code) if is_healthy_status(code) => println!("  http:       healthy ({code})"),
        Some(code) => println!("  http:       unhealthy ({code})"),
        None => println!("  http:       unreachable"),
    }
    let online = probes.ping(&cfg.ping_target, cfg.ping_timeout).await;
    println!(
        "  network:    {} (ping {})",
        if online { "online" } else { "offline" },
        cfg.ping_target
    );
    let external = probes
        .http_status(&cfg.discord_check_url, HTTP_TIMEOUT)
        .await
        == Some(200);
    println!(
        "  external:   {}",
        if external { "reachable" } else { "unreachable" }
    );
    println!();

    // ── Config safeguard ──────────────────────────────────────────────────
    println!("Config safeguard:");
    let safeguard = ConfigSafeguard::new(
        cfg.config_path.clone(),
        &cfg.state_dir,
        cfg.rollback_timeout,
        cfg.snapshot_retention,
    );
    println!("  watched:    {}", cfg.config_path.display());
    match safeguard.recorded_checksum() {
        Some(sum) => println!("  checksum:   {}…", &sum[..12.min(sum.len())]),
        None => println!("  checksum:   (not yet recorded)"),
    }
    match safeguard.armed() {
        Some(ticket) => println!(
            "  armed:      rollback in {}s (snapshot {})",
            ticket.remaining(epoch_now()),
            ticket.snapshot.display()
        ),
        None => println!("  armed:      none"),
    }
    let snapshots = safeguard.snapshots();
    match snapshots.first().and_then(|p| p.file_name()) {
        Some(latest) => println!(
            "  snapshots:  {} (latest {})",
            snapshots.len(),
            latest.to_string_lossy()
        ),
        None => println!("  snapshots:  0"),
    }
    println!();

    // ── Backup archiver ───────────────────────────────────────────────────
    println!("Backup archiver:");
    let archiver = FileHistoryArchiver::new(cfg.config_path.clone(), cfg.backups_dir());
    let status = archiver.status();
    match status.latest {
        Some(latest) => println!("  entries:    {} (latest {latest})", status.entries),
        None => println!("  entries:    0"),
    }
}
