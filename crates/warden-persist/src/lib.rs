//! Crash-safe on-disk state for the warden supervisor.
//!
//! Everything the supervisor must remember across its own crashes goes
//! through this crate: write-then-rename file updates, the pid file, config
//! fingerprinting, and append-only log trimming. A reader must never observe
//! a truncated state file.

#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another instance is running (pid {0})")]
    AlreadyRunning(u32),

    #[error("pid file {0} holds no readable pid")]
    MalformedPidFile(PathBuf),
}

pub type PersistResult<T> = Result<T, PersistError>;

fn io_err(path: &Path, source: io::Error) -> PersistError {
    PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ─── Atomic writes ────────────────────────────────────────────────────────────

/// Write `contents` to `path` via a sibling temp file and rename.
///
/// The rename is atomic on POSIX filesystems, so a crash mid-update leaves
/// either the old file or the new one, never a partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> PersistResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Read a file to a string, returning `None` when it does not exist.
pub fn read_if_present(path: &Path) -> PersistResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

// ─── Config fingerprinting ────────────────────────────────────────────────────

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> PersistResult<String> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ─── Pid file ─────────────────────────────────────────────────────────────────

/// Single-instance marker: a file holding the supervisor's decimal pid.
///
/// A pid file whose recorded process is gone is stale and silently replaced;
/// a pid file whose process is alive refuses acquisition.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded on disk, if any.
    pub fn read(&self) -> PersistResult<Option<u32>> {
        match read_if_present(&self.path)? {
            None => Ok(None),
            Some(s) => s
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| PersistError::MalformedPidFile(self.path.clone())),
        }
    }

    /// Claim the pid file for this process.
    ///
    /// Errors with [`PersistError::AlreadyRunning`] when the recorded pid is
    /// still alive; removes a stale file and proceeds otherwise.
    pub fn acquire(&self) -> PersistResult<()> {
        match self.read() {
            Ok(Some(pid)) if process_alive_by_pid(pid) => {
                return Err(PersistError::AlreadyRunning(pid));
            }
            Ok(Some(pid)) => {
                warn!(pid, path = %self.path.display(), "removing stale pid file");
            }
            Ok(None) => {}
            Err(PersistError::MalformedPidFile(_)) => {
                warn!(path = %self.path.display(), "replacing malformed pid file");
            }
            Err(e) => return Err(e),
        }
        atomic_write(&self.path, format!("{}\n", std::process::id()).as_bytes())
    }

    /// Release on graceful shutdown. Missing file is not an error.
    pub fn release(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
            }
        }
    }

    /// True when the recorded pid exists and its process is alive.
    pub fn live_pid(&self) -> Option<u32> {
        match self.read() {
            Ok(Some(pid)) if process_alive_by_pid(pid) => Some(pid),
            _ => None,
        }
    }
}

/// Is the given pid present in the OS process table?
pub fn process_alive_by_pid(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    sys.process(target).is_some()
}

// ─── Log trimming ─────────────────────────────────────────────────────────────

/// Trim `path` to its newest `max_lines / 2` lines once it exceeds
/// `max_lines`, via a temp file renamed over the original.
///
/// Returns the number of lines dropped (0 when under the limit or the file
/// is missing).
pub fn trim_log(path: &Path, max_lines: usize) -> PersistResult<usize> {
    let Some(contents) = read_if_present(path)? else {
        return Ok(0);
    };
    let lines: Vec<&str> = contents.lines().collect();
    if lines.len() <= max_lines {
        return Ok(0);
    }

    let keep = max_lines / 2;
    let tail = &lines[lines.len() - keep..];
    let mut out = tail.join("\n");
    out.push('\n');
    atomic_write(path, out.as_bytes())?;

    let dropped = lines.len() - keep;
    debug!(path = %path.display(), dropped, kept = keep, "trimmed log file");
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a").join("b").join("state.txt");
        atomic_write(&path, b"hello").expect("write");
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.txt");
        atomic_write(&path, b"first").expect("write1");
        atomic_write(&path, b"second").expect("write2");
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.txt");
        atomic_write(&path, b"data").expect("write");
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        // SHA-256("abc")
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256_file_changes_with_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        fs::write(&path, b"one").unwrap();
        let h1 = sha256_file(&path).unwrap();
        fs::write(&path, b"two").unwrap();
        let h2 = sha256_file(&path).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn pid_file_acquire_and_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pidfile = PidFile::new(dir.path().join("watchdog.pid"));

        pidfile.acquire().expect("acquire");
        assert_eq!(pidfile.read().unwrap(), Some(std::process::id()));
        // Our own pid is alive, so a second instance must be refused.
        assert!(matches!(
            pidfile.acquire(),
            Err(PersistError::AlreadyRunning(_))
        ));

        pidfile.release();
        assert_eq!(pidfile.read().unwrap(), None);
    }

    #[test]
    fn pid_file_stale_pid_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("watchdog.pid");
        // Pid near the u32 max will not exist on any sane host.
        fs::write(&path, "4294967294\n").unwrap();

        let pidfile = PidFile::new(path);
        pidfile.acquire().expect("stale pid should be evicted");
        assert_eq!(pidfile.read().unwrap(), Some(std::process::id()));
    }

    #[test]
    fn pid_file_malformed_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("watchdog.pid");
        fs::write(&path, "not-a-pid\n").unwrap();

        let pidfile = PidFile::new(path);
        pidfile.acquire().expect("malformed pid file should be replaced");
    }

    #[test]
    fn trim_log_under_limit_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.log");
        fs::write(&path, "a\nb\nc\n").unwrap();
        assert_eq!(trim_log(&path, 10).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn trim_log_keeps_newest_half() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.log");
        let lines: Vec<String> = (0..100).map(|i| format!("line-{i}")).collect();
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let dropped = trim_log(&path, 50).unwrap();
        assert_eq!(dropped, 75);

        let kept = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = kept.lines().collect();
        assert_eq!(kept.len(), 25);
        assert_eq!(kept[0], "line-75");
        assert_eq!(kept[24], "line-99");
    }

    #[test]
    fn trim_log_missing_file_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(trim_log(&dir.path().join("absent.log"), 10).unwrap(), 0);
    }
}
