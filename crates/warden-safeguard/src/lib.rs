//! Commit-confirmed configuration safeguard.
//!
//! Every mutation of the watched gateway config becomes reversible without a
//! human: a content-hash change arms a durable rollback ticket, and the
//! change only survives if the gateway stays healthy until the deadline. Any
//! unhealthy observation inside the window rolls the file back immediately.
//!
//! The armed ticket lives on disk (`state/rollback-armed.flag`, two lines:
//! deadline epoch and snapshot path) because a safety net that forgets its
//! own in-flight state across a supervisor crash is not a safety net. All
//! state-file updates go through write-then-rename.

#![forbid(unsafe_code)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use warden_persist::{atomic_write, read_if_present, sha256_file, PersistError};

/// File names under the supervisor state directory.
pub const CHECKSUM_FILE: &str = "config-checksum";
pub const TICKET_FILE: &str = "rollback-armed.flag";

#[derive(Debug, Error)]
pub enum SafeguardError {
    #[error("watched config missing at {0}")]
    ConfigMissing(PathBuf),

    #[error("no snapshot available")]
    NoSnapshot,

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type SafeguardResult<T> = Result<T, SafeguardError>;

fn io_err(path: &Path, source: std::io::Error) -> SafeguardError {
    SafeguardError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ─── Snapshots ────────────────────────────────────────────────────────────────

/// Why a snapshot was taken; encoded into its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotReason {
    PreChange,
    Manual,
    Broken,
}

impl fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreChange => "pre-change",
            Self::Manual => "manual",
            Self::Broken => "broken",
        })
    }
}

// ─── Armed ticket ─────────────────────────────────────────────────────────────

/// Durable commit-confirmed ticket: a change is awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedTicket {
    /// Absolute epoch at which the change auto-confirms.
    pub deadline: u64,
    /// Snapshot referenced for rollback.
    pub snapshot: PathBuf,
}

impl ArmedTicket {
    /// Load from the two-line ticket file. A malformed file is an invariant
    /// violation: logged at error and removed so it cannot wedge every tick.
    fn load(path: &Path) -> Option<Self> {
        let contents = match read_if_present(path) {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot read armed ticket");
                return None;
            }
        };
        let mut lines = contents.lines();
        let parsed = match (lines.next(), lines.next()) {
            (Some(deadline), Some(snapshot)) => {
                deadline.trim().parse::<u64>().ok().map(|deadline| Self {
                    deadline,
                    snapshot: PathBuf::from(snapshot.trim()),
                })
            }
            _ => None,
        };
        if parsed.is_none() {
            error!(path = %path.display(), "malformed armed ticket, discarding");
            let _ = std::fs::remove_file(path);
        }
        parsed
    }

    fn store(&self, path: &Path) -> SafeguardResult<()> {
        let contents = format!("{}\n{}\n", self.deadline, self.snapshot.display());
        atomic_write(path, contents.as_bytes())?;
        Ok(())
    }

    pub fn remaining(&self, now: u64) -> u64 {
        self.deadline.saturating_sub(now)
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// What one safeguard tick did. `RolledBack` obliges the caller to request a
/// gateway restart with reason `config-rollback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeguardEvent {
    Idle,
    /// First run: checksum recorded, nothing armed.
    Bootstrapped,
    /// Change detected and ticket armed.
    Armed { deadline: u64, snapshot: PathBuf },
    /// Ticket armed and gateway healthy (or not yet observed); waiting out
    /// the window.
    ArmedWaiting {
        remaining: u64,
        healthy_since: Option<u64>,
    },
    /// Deadline reached while healthy; ticket removed.
    Confirmed,
    /// Gateway unhealthy inside the window; config restored from `snapshot`.
    RolledBack { snapshot: PathBuf },
    /// Something failed; state untouched, retried next tick.
    Skipped,
}

// ─── Safeguard ────────────────────────────────────────────────────────────────

/// The commit-confirmed engine for one watched config file.
#[derive(Debug)]
pub struct ConfigSafeguard {
    config_path: PathBuf,
    checksum_file: PathBuf,
    ticket_file: PathBuf,
    snapshots_dir: PathBuf,
    rollback_timeout: u64,
    retention: usize,
    change_settle: Duration,
    /// Epoch of the first healthy observation under the current ticket.
    /// In-memory only: a supervisor restart re-enters the unseen state.
    healthy_since: Option<u64>,
}

impl ConfigSafeguard {
    pub fn new(
        config_path: PathBuf,
        state_root: &Path,
        rollback_timeout: u64,
        retention: usize,
    ) -> Self {
        Self {
            config_path,
            checksum_file: state_root.join("state").join(CHECKSUM_FILE),
            ticket_file: state_root.join("state").join(TICKET_FILE),
            snapshots_dir: state_root.join("snapshots"),
            rollback_timeout,
            retention,
            change_settle: Duration::from_secs(10),
            healthy_since: None,
        }
    }

    /// Override the post-change settle (production default 10 s). The settle
    /// gives the actor that edited the config time to finish its own gateway
    /// restart before the armed window starts judging health.
    pub fn with_change_settle(mut self, settle: Duration) -> Self {
        self.change_settle = settle;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Currently armed ticket, if any.
    pub fn armed(&self) -> Option<ArmedTicket> {
        ArmedTicket::load(&self.ticket_file)
    }

    /// Last recorded config fingerprint.
    pub fn recorded_checksum(&self) -> Option<String> {
        read_if_present(&self.checksum_file)
            .ok()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    // ─── tick ─────────────────────────────────────────────────────────────

    /// One safeguard pass: detect change, advance the armed window, or fire
    /// rollback. Internal failures log and degrade to [`SafeguardEvent::Skipped`];
    /// they never abort the supervisor tick.
    pub fn tick(&mut self, gateway_healthy: bool, now: u64) -> SafeguardEvent {
        if !self.config_path.exists() {
            debug!(path = %self.config_path.display(), "watched config missing, skipping");
            return SafeguardEvent::Idle;
        }

        if let Some(ticket) = self.armed() {
            return self.armed_tick(ticket, gateway_healthy, now);
        }

        let digest = match sha256_file(&self.config_path) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "cannot fingerprint config");
                return SafeguardEvent::Skipped;
            }
        };

        match self.recorded_checksum() {
            None => {
                if let Err(e) = atomic_write(&self.checksum_file, digest.as_bytes()) {
                    error!(error = %e, "cannot record bootstrap checksum");
                    return SafeguardEvent::Skipped;
                }
                info!(checksum = &digest[..12], "config fingerprint bootstrapped");
                SafeguardEvent::Bootstrapped
            }
            Some(prev) if prev == digest => SafeguardEvent::Idle,
            Some(prev) => {
                info!(
                    old = &prev[..12.min(prev.len())],
                    new = &digest[..12],
                    "config change detected"
                );
                self.arm(digest, now)
            }
        }
    }

    /// Arm a ticket for a freshly detected change. The snapshot is written
    /// first; if it cannot be, no ticket is created and the change is
    /// re-detected next tick.
    fn arm(&mut self, new_digest: String, now: u64) -> SafeguardEvent {
        let snapshot = match self.snapshot(SnapshotReason::PreChange) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "pre-change snapshot failed, not arming");
                return SafeguardEvent::Skipped;
            }
        };

        // Let whoever edited the config finish restarting the gateway before
        // the armed window starts sampling health.
        if !self.change_settle.is_zero() {
            std::thread::sleep(self.change_settle);
        }

        let ticket = ArmedTicket {
            deadline: now + self.rollback_timeout,
            snapshot: snapshot.clone(),
        };
        if let Err(e) = ticket.store(&self.ticket_file) {
            error!(error = %e, "cannot persist armed ticket");
            return SafeguardEvent::Skipped;
        }
        if let Err(e) = atomic_write(&self.checksum_file, new_digest.as_bytes()) {
            error!(error = %e, "cannot persist new checksum");
        }
        self.healthy_since = None;
        info!(
            deadline = ticket.deadline,
            snapshot = %snapshot.display(),
            "rollback ticket armed"
        );
        SafeguardEvent::Armed {
            deadline: ticket.deadline,
            snapshot,
        }
    }

    /// The armed-state machine: confirm at the deadline while healthy, roll
    /// back immediately on any unhealthy observation.
    fn armed_tick(&mut self, ticket: ArmedTicket, gateway_healthy: bool, now: u64) -> SafeguardEvent {
        if gateway_healthy {
            if self.healthy_since.is_none() {
                self.healthy_since = Some(now);
                info!(deadline = ticket.deadline, "gateway healthy under armed ticket");
            }
            if now >= ticket.deadline {
                match self.confirm() {
                    Ok(_) => {
                        info!("config change auto-confirmed");
                        SafeguardEvent::Confirmed
                    }
                    Err(e) => {
                        error!(error = %e, "auto-confirm failed");
                        SafeguardEvent::Skipped
                    }
                }
            } else {
                SafeguardEvent::ArmedWaiting {
                    remaining: ticket.remaining(now),
                    healthy_since: self.healthy_since,
                }
            }
        } else {
            warn!(
                snapshot = %ticket.snapshot.display(),
                "gateway unhealthy inside rollback window, reverting config"
            );
            match self.rollback(None) {
                Ok(snapshot) => SafeguardEvent::RolledBack { snapshot },
                Err(e) => {
                    error!(error = %e, "rollback failed, ticket left armed");
                    SafeguardEvent::Skipped
                }
            }
        }
    }

    // ─── confirm ──────────────────────────────────────────────────────────

    /// Accept the in-flight change: remove the ticket, keep the snapshots.
    /// Idempotent; returns whether a ticket was actually removed.
    pub fn confirm(&mut self) -> SafeguardResult<bool> {
        self.healthy_since = None;
        match std::fs::remove_file(&self.ticket_file) {
            Ok(()) => {
                // Re-record the live fingerprint so the checksum invariant
                // holds even if the file changed again inside the window.
                if self.config_path.exists() {
                    let digest = sha256_file(&self.config_path)?;
                    atomic_write(&self.checksum_file, digest.as_bytes())?;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&self.ticket_file, e)),
        }
    }

    // ─── rollback ─────────────────────────────────────────────────────────

    /// Restore the config from a snapshot: the requested one, else the armed
    /// ticket's, else the newest on disk. The discarded live file is archived
    /// with reason `broken` first. Clears the ticket and rewrites the
    /// checksum. The caller owes the gateway a restart (`config-rollback`).
    pub fn rollback(&mut self, requested: Option<&Path>) -> SafeguardResult<PathBuf> {
        let chosen = self.select_rollback_target(requested)?;

        // Keep the bad file for the post-mortem. Failure here must not block
        // the restore itself.
        if self.config_path.exists() {
            if let Err(e) = self.snapshot(SnapshotReason::Broken) {
                warn!(error = %e, "could not archive broken config");
            }
        }

        let contents = std::fs::read(&chosen).map_err(|e| io_err(&chosen, e))?;
        atomic_write(&self.config_path, &contents)?;

        let digest = sha256_file(&self.config_path)?;
        atomic_write(&self.checksum_file, digest.as_bytes())?;

        if let Err(e) = std::fs::remove_file(&self.ticket_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(&self.ticket_file, e));
            }
        }
        self.healthy_since = None;
        self.prune_snapshots();

        info!(snapshot = %chosen.display(), "config rolled back");
        Ok(chosen)
    }

    fn select_rollback_target(&self, requested: Option<&Path>) -> SafeguardResult<PathBuf> {
        if let Some(path) = requested {
            return if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(SafeguardError::NoSnapshot)
            };
        }
        if let Some(ticket) = self.armed() {
            if ticket.snapshot.exists() {
                return Ok(ticket.snapshot);
            }
            error!(
                snapshot = %ticket.snapshot.display(),
                "armed ticket references a missing snapshot"
            );
        }
        self.snapshots()
            .into_iter()
            .next()
            .ok_or(SafeguardError::NoSnapshot)
    }

    // ─── snapshot ─────────────────────────────────────────────────────────

    /// Copy the live config into the snapshot store and prune to retention.
    pub fn snapshot(&self, reason: SnapshotReason) -> SafeguardResult<PathBuf> {
        if !self.config_path.exists() {
            return Err(SafeguardError::ConfigMissing(self.config_path.clone()));
        }
        let stem = self
            .config_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let name = format!("{stem}-{stamp}-{reason}.json");
        let dest = self.snapshots_dir.join(name);

        let contents = std::fs::read(&self.config_path)
            .map_err(|e| io_err(&self.config_path, e))?;
        atomic_write(&dest, &contents)?;
        debug!(snapshot = %dest.display(), %reason, "snapshot written");

        self.prune_snapshots();
        Ok(dest)
    }

    /// All snapshots, newest first (the timestamp in the name sorts
    /// lexicographically).
    pub fn snapshots(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.snapshots_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        files
    }

    /// Enforce retention newest-first, never deleting the snapshot referenced
    /// by the current armed ticket.
    fn prune_snapshots(&self) {
        let armed_snapshot = self.armed().map(|t| t.snapshot);
        let files = self.snapshots();
        for stale in files.iter().skip(self.retention) {
            if armed_snapshot.as_deref() == Some(stale.as_path()) {
                continue;
            }
            match std::fs::remove_file(stale) {
                Ok(()) => debug!(snapshot = %stale.display(), "pruned old snapshot"),
                Err(e) => warn!(snapshot = %stale.display(), error = %e, "prune failed"),
            }
        }
    }
}
