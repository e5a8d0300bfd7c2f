//! Per-repo lock file (`repos/<repo_id>/.lock`).
//!
//! Acquisition is non-blocking: a contended lock fails immediately with the
//! holder's details so the user can decide whether to retry. Locks left behind
//! by dead processes, or older than `stale_after`, are broken automatically.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::errors::{AgencyError, ErrorCode};
use crate::io::fs::{Fs, OsFs};

pub const LOCK_FILE: &str = ".lock";
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    /// RFC3339 UTC.
    pub created_at: String,
    pub cmd: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock. `info` is `None` when retries ran
    /// out without reading a stable holder.
    #[error("repo is locked{}", holder(.info))]
    Held { info: Option<LockInfo> },
    #[error("lock io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn holder(info: &Option<LockInfo>) -> String {
    match info {
        Some(i) => format!(" by pid {} since {} ({})", i.pid, i.created_at, i.cmd),
        None => String::new(),
    }
}

impl From<LockError> for AgencyError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { info } => {
                let mut e = AgencyError::new(
                    ErrorCode::LockHeld,
                    format!("repo is locked{}; retry once it finishes", holder(&info)),
                );
                if let Some(info) = info {
                    e = e
                        .with_detail("pid", info.pid.to_string())
                        .with_detail("created_at", info.created_at)
                        .with_detail("cmd", info.cmd);
                }
                e
            }
            other @ LockError::Io { .. } => {
                AgencyError::new(ErrorCode::Internal, other.to_string()).with_cause(other)
            }
        }
    }
}

/// Lock factory rooted at the data directory.
pub struct RepoLock<'a> {
    fs: &'a dyn Fs,
    data_dir: PathBuf,
    stale_after: Duration,
    attempts: u32,
}

impl<'a> RepoLock<'a> {
    pub fn new(fs: &'a dyn Fs, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            data_dir: data_dir.into(),
            stale_after: DEFAULT_STALE_AFTER,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn lock_path(&self, repo_id: &str) -> PathBuf {
        self.data_dir.join("repos").join(repo_id).join(LOCK_FILE)
    }

    /// Acquire the lock for `repo_id`, recording `cmd` for diagnostics.
    #[instrument(skip(self, cmd))]
    pub fn lock(&self, repo_id: &str, cmd: &str) -> Result<LockGuard, LockError> {
        let path = self.lock_path(repo_id);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).map_err(io_err)?;
        }

        for attempt in 1..=self.attempts {
            let info = LockInfo {
                pid: std::process::id(),
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                cmd: cmd.to_string(),
            };
            let body = serde_json::to_vec(&info).map_err(|e| io_err(e.into()))?;
            match self.fs.create_new(&path, &body) {
                Ok(()) => {
                    debug!(attempt, "lock acquired");
                    return Ok(LockGuard {
                        path: path.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            match self.inspect(&path) {
                Holder::Gone => continue,
                Holder::Stale(reason) => {
                    info!(attempt, reason, "breaking stale lock");
                    match self.fs.remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
                Holder::Live(info) => {
                    warn!(pid = info.as_ref().map(|i| i.pid), "lock held");
                    return Err(LockError::Held { info });
                }
            }
        }

        warn!(attempts = self.attempts, "lock retries exhausted");
        Err(LockError::Held { info: None })
    }

    fn inspect(&self, path: &Path) -> Holder {
        let raw = match self.fs.read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Holder::Gone,
            Err(_) => return self.inspect_by_mtime(path),
        };
        let Ok(info) = serde_json::from_slice::<LockInfo>(&raw) else {
            return self.inspect_by_mtime(path);
        };
        if !is_process_alive(info.pid) {
            return Holder::Stale("holder process is gone");
        }
        let too_old = DateTime::parse_from_rfc3339(&info.created_at)
            .map(|created| {
                let age = Utc::now().signed_duration_since(created.with_timezone(&Utc));
                age.to_std().is_ok_and(|age| age > self.stale_after)
            })
            // An unparseable timestamp gives no age evidence; trust the pid.
            .unwrap_or(false);
        if too_old {
            return Holder::Stale("lock older than stale_after");
        }
        Holder::Live(Some(info))
    }

    fn inspect_by_mtime(&self, path: &Path) -> Holder {
        let modified = match self.fs.metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Holder::Gone,
            Err(_) => return Holder::Live(None),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > self.stale_after {
            Holder::Stale("unreadable lock file older than stale_after")
        } else {
            Holder::Live(None)
        }
    }
}

enum Holder {
    Gone,
    Stale(&'static str),
    Live(Option<LockInfo>),
}

/// Held lock. Released by [`LockGuard::unlock`] or on drop.
///
/// Release always goes to the real filesystem: the guard outlives the
/// borrowed [`Fs`] it was acquired through.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Remove the lock file. Calling it again, or after someone else removed
    /// the file, is not an error.
    pub fn unlock(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match OsFs.remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.path.display(), err = %e, "failed to release repo lock");
        }
    }
}

/// Signal-0 liveness check: success or `EPERM` means alive, `ESRCH` dead.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs::{self, File, Metadata};

    use super::*;

    /// Re-creates a dead holder's lock right after every removal, so stale
    /// breaking never makes progress.
    struct RespawningLockFs {
        contents: String,
        removals: Cell<u32>,
    }

    impl Fs for RespawningLockFs {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            OsFs.read(path)
        }
        fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            OsFs.write(path, contents)
        }
        fn metadata(&self, path: &Path) -> io::Result<Metadata> {
            OsFs.metadata(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            OsFs.rename(from, to)
        }
        fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
            OsFs.set_mode(path, mode)
        }
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            OsFs.create_dir_all(path)
        }
        fn create_dir(&self, path: &Path) -> io::Result<()> {
            OsFs.create_dir(path)
        }
        fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            OsFs.create_new(path, contents)
        }
        fn create_temp(&self, dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)> {
            OsFs.create_temp(dir, prefix)
        }
        fn remove_file(&self, path: &Path) -> io::Result<()> {
            OsFs.remove_file(path)?;
            self.removals.set(self.removals.get() + 1);
            OsFs.write(path, self.contents.as_bytes())
        }
        fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
            OsFs.list_dirs(path)
        }
    }

    fn write_lock(lock: &RepoLock<'_>, repo_id: &str, contents: &str) -> PathBuf {
        let path = lock.lock_path(repo_id);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, contents).expect("write lock");
        path
    }

    fn info_json(pid: u32, created_at: &str) -> String {
        serde_json::to_string(&LockInfo {
            pid,
            created_at: created_at.to_string(),
            cmd: "agency run".to_string(),
        })
        .expect("json")
    }

    #[test]
    fn second_lock_is_held_with_holder_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        let guard = lock.lock("r1", "agency run").expect("first");

        let err = lock.lock("r1", "agency run").expect_err("second");
        let LockError::Held { info: Some(info) } = err else {
            panic!("expected held with info, got {err:?}");
        };
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.cmd, "agency run");
        drop(guard);
    }

    #[test]
    fn unlock_is_idempotent_and_allows_relock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        let mut guard = lock.lock("r1", "agency run").expect("lock");
        guard.unlock().expect("unlock");
        guard.unlock().expect("unlock again");
        assert!(!lock.lock_path("r1").exists());

        let _again = lock.lock("r1", "agency run").expect("relock");
    }

    #[test]
    fn drop_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        {
            let _guard = lock.lock("r1", "agency run").expect("lock");
            assert!(lock.lock_path("r1").exists());
        }
        assert!(!lock.lock_path("r1").exists());
    }

    #[test]
    fn dead_pid_is_stolen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        write_lock(&lock, "r1", &info_json(999_999_999, &now));

        let _guard = lock.lock("r1", "agency run").expect("stolen");
        let raw = fs::read(lock.lock_path("r1")).expect("read");
        let info: LockInfo = serde_json::from_slice(&raw).expect("parse");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn old_lock_from_live_pid_is_stolen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        let old = (Utc::now() - chrono::Duration::hours(3)).to_rfc3339_opts(SecondsFormat::Secs, true);
        write_lock(&lock, "r1", &info_json(std::process::id(), &old));

        lock.lock("r1", "agency run").expect("stolen");
    }

    #[test]
    fn stale_after_is_configurable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        let recent = (Utc::now() - chrono::Duration::minutes(10))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        write_lock(&lock, "r1", &info_json(std::process::id(), &recent));

        let err = lock.lock("r1", "agency run").expect_err("default keeps it");
        assert!(matches!(err, LockError::Held { info: Some(_) }));

        let short = RepoLock::new(&OsFs, temp.path()).with_stale_after(Duration::from_secs(60));
        short.lock("r1", "agency run").expect("stolen under short stale_after");
    }

    #[test]
    fn exhausted_retries_are_held_without_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let fs = RespawningLockFs {
            contents: info_json(999_999_999, &now),
            removals: Cell::new(0),
        };
        let lock = RepoLock::new(&fs, temp.path()).with_attempts(3);
        write_lock(&lock, "r1", &fs.contents);

        let err = lock.lock("r1", "agency run").expect_err("never acquired");
        assert!(matches!(err, LockError::Held { info: None }));
        assert_eq!(fs.removals.get(), 3);
    }

    #[test]
    fn corrupt_fresh_lock_is_held_without_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        write_lock(&lock, "r1", "not json");

        let err = lock.lock("r1", "agency run").expect_err("held");
        assert!(matches!(err, LockError::Held { info: None }));
    }

    #[test]
    fn corrupt_old_lock_is_stolen_by_mtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = RepoLock::new(&OsFs, temp.path());
        let path = write_lock(&lock, "r1", "not json");
        let file = File::options().write(true).open(&path).expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(3 * 60 * 60))
            .expect("set mtime");
        drop(file);

        lock.lock("r1", "agency run").expect("stolen");
    }

    #[test]
    fn held_converts_to_lock_held_code() {
        let e: AgencyError = LockError::Held {
            info: Some(LockInfo {
                pid: 42,
                created_at: "2026-01-10T00:00:00Z".to_string(),
                cmd: "agency run".to_string(),
            }),
        }
        .into();
        assert_eq!(e.code(), ErrorCode::LockHeld);
        assert_eq!(e.detail("pid"), Some("42"));
    }

    #[test]
    fn liveness_follows_signal_zero() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(999_999_999));
        assert!(!is_process_alive(0));
    }
}
