//! Periodic config backup.
//!
//! The production archiver keeps a git-backed versioned store; its internals
//! live outside this process. The supervisor only depends on the
//! [`Archiver`] trait plus the rate limiter here, and ships a plain
//! copy-into-directory implementation so a fresh install has history from
//! day one.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use warden_persist::{atomic_write, sha256_file};

/// Outcome of one archiver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// A new entry was written.
    Archived(PathBuf),
    /// Source unchanged since the latest entry; nothing written.
    Unchanged,
    /// Source file absent; nothing to archive.
    SourceMissing,
}

/// What `status` reports about the archive store.
#[derive(Debug, Clone, Default)]
pub struct ArchiverStatus {
    pub entries: usize,
    pub latest: Option<String>,
    /// Epoch of the last run, when known.
    pub last_run: Option<u64>,
}

/// The file-history archiver contract the supervisor consumes.
pub trait Archiver {
    fn run(&mut self) -> Result<ArchiveOutcome>;
    fn status(&self) -> ArchiverStatus;
}

// ─── Default implementation ───────────────────────────────────────────────────

/// Copies the watched config into a timestamped history directory, skipping
/// runs where the content has not changed.
pub struct FileHistoryArchiver {
    source: PathBuf,
    store_dir: PathBuf,
}

impl FileHistoryArchiver {
    pub fn new(source: PathBuf, store_dir: PathBuf) -> Self {
        Self { source, store_dir }
    }

    fn entries(&self) -> Vec<PathBuf> {
        let Ok(dir) = std::fs::read_dir(&self.store_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        files
    }
}

impl Archiver for FileHistoryArchiver {
    fn run(&mut self) -> Result<ArchiveOutcome> {
        if !self.source.exists() {
            debug!(source = %self.source.display(), "backup source missing");
            return Ok(ArchiveOutcome::SourceMissing);
        }

        let digest = sha256_file(&self.source).context("fingerprint backup source")?;
        if let Some(latest) = self.entries().first() {
            if sha256_file(latest).ok().as_deref() == Some(digest.as_str()) {
                return Ok(ArchiveOutcome::Unchanged);
            }
        }

        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let mut dest = self.store_dir.join(format!("{stem}-{stamp}.json"));
        // Same-second runs get a disambiguating suffix instead of clobbering.
        let mut seq = 1;
        while dest.exists() {
            seq += 1;
            dest = self.store_dir.join(format!("{stem}-{stamp}-{seq}.json"));
        }

        let contents = std::fs::read(&self.source).context("read backup source")?;
        atomic_write(&dest, &contents).context("write backup entry")?;
        info!(entry = %dest.display(), "config archived");
        Ok(ArchiveOutcome::Archived(dest))
    }

    fn status(&self) -> ArchiverStatus {
        let entries = self.entries();
        ArchiverStatus {
            entries: entries.len(),
            latest: entries
                .first()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string())),
            last_run: None,
        }
    }
}

// ─── Rate limiting ────────────────────────────────────────────────────────────

/// Runs the wrapped archiver at most once per `interval_secs`.
pub struct RateLimited<A: Archiver> {
    inner: A,
    interval_secs: u64,
    last_run: Option<u64>,
}

impl<A: Archiver> RateLimited<A> {
    pub fn new(inner: A, interval_secs: u64) -> Self {
        Self {
            inner,
            interval_secs,
            last_run: None,
        }
    }

    /// Run the archiver if due. `None` means rate-limited.
    pub fn maybe_run(&mut self, now: u64) -> Option<ArchiveOutcome> {
        let due = match self.last_run {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval_secs,
        };
        if !due {
            return None;
        }
        self.last_run = Some(now);
        match self.inner.run() {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "config backup failed");
                None
            }
        }
    }

    pub fn status(&self) -> ArchiverStatus {
        ArchiverStatus {
            last_run: self.last_run,
            ..self.inner.status()
        }
    }
}
