//! Advisory, pid-based lock over a repository's cache directory.
//!
//! The lock is a file holding the decimal pid of its owner. Checking for an existing
//! lock and creating a new one are two steps; `create_new` makes a concurrent creator
//! lose instead of overwriting, but the check itself is not atomic with the removal
//! of a stale lock. The lock assumes every user runs on the same host.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::CacheError;

/// Name of the lock file inside the cache directory.
pub const LOCK_FILE: &str = "lock";

/// A lock file this long cannot hold a pid.
const MAX_LOCK_LEN: u64 = 10;

/// Process-liveness check.
pub trait ProcessProbe {
    /// Whether a process with this pid is currently running.
    fn is_running(&self, pid: u32) -> bool;
}

/// Liveness check against the local operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(target_os = "linux")]
    fn is_running(&self, pid: u32) -> bool {
        // An exited but unreaped process keeps /proc/<pid> in state Z.
        fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| stat_is_live(&stat))
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn is_running(&self, pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map_or(true, |output| output.status.success())
    }

    #[cfg(not(unix))]
    fn is_running(&self, _pid: u32) -> bool {
        true
    }
}

/// Whether a `/proc/<pid>/stat` line describes a process that has not exited.
///
/// The command name sits in parentheses and may itself contain spaces or `)`, so
/// the state is the first field after the last `)`.
#[cfg(target_os = "linux")]
fn stat_is_live(stat: &str) -> bool {
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| !matches!(state, 'Z' | 'X' | 'x'))
}

/// A held repository lock. Released by [`LockGuard::release`] or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Take the lock in `dir`, creating the directory if needed.
    ///
    /// A lock left by a dead process is removed and creation retried once, unless
    /// `reclaim_stale` is false.
    ///
    /// # Errors
    /// - [`CacheError::RepositoryLocked`] when a live process owns the lock.
    /// - [`CacheError::CorruptLock`] when the lock file does not hold a pid.
    /// - [`CacheError::StaleLock`] when the owner is dead and reclamation is disabled.
    pub fn acquire(
        dir: &Path,
        probe: &dyn ProcessProbe,
        reclaim_stale: bool,
    ) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut reclaimed = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let pid = std::process::id();
                    if let Err(err) = write!(file, "{pid}").and_then(|()| file.sync_all()) {
                        if let Err(remove) = fs::remove_file(&path) {
                            warn!(path = %path.display(), %remove, "Failed to remove lock");
                        }
                        return Err(err.into());
                    }
                    debug!(pid, path = %path.display(), "Acquired repository lock");
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let pid = read_pid(&path)?;
                    if reclaimed || probe.is_running(pid) {
                        return Err(CacheError::RepositoryLocked { pid });
                    }
                    if !reclaim_stale {
                        return Err(CacheError::StaleLock { pid });
                    }
                    warn!(
                        pid,
                        path = %path.display(),
                        "Removing stale lock left by a dead process"
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                    reclaimed = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Location of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file.
    ///
    /// # Errors
    /// Returns the filesystem error if the file cannot be removed.
    pub fn release(mut self) -> Result<(), CacheError> {
        self.released = true;
        remove_lock(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_lock(&self.path) {
            warn!(path = %self.path.display(), %err, "Failed to release repository lock");
        }
    }
}

fn remove_lock(path: &Path) -> Result<(), CacheError> {
    fs::remove_file(path)?;
    debug!(path = %path.display(), "Released repository lock");
    Ok(())
}

fn read_pid(path: &Path) -> Result<u32, CacheError> {
    let corrupt = || CacheError::CorruptLock {
        path: path.to_path_buf(),
    };
    let mut raw = Vec::new();
    File::open(path)?
        .take(MAX_LOCK_LEN)
        .read_to_end(&mut raw)?;
    if raw.len() as u64 >= MAX_LOCK_LEN {
        return Err(corrupt());
    }
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(corrupt)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct FakeProbe(HashSet<u32>);

    impl ProcessProbe for FakeProbe {
        fn is_running(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    fn alive(pids: &[u32]) -> FakeProbe {
        FakeProbe(pids.iter().copied().collect())
    }

    #[test]
    fn acquire_writes_own_pid_and_release_removes_it() {
        let temp = TempDir::new().expect("tempdir");
        let dir = temp.path().join("cache");
        let guard = LockGuard::acquire(&dir, &alive(&[]), true).expect("acquire");
        let content = fs::read_to_string(guard.path()).expect("read lock");
        assert_eq!(content, std::process::id().to_string());
        assert!(content.len() < 10);

        let path = guard.path().to_path_buf();
        guard.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn live_owner_refuses_acquisition() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(LOCK_FILE), "4242").expect("write lock");
        let err = LockGuard::acquire(temp.path(), &alive(&[4242]), true).expect_err("locked");
        assert!(matches!(err, CacheError::RepositoryLocked { pid: 4242 }));
        assert!(temp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(LOCK_FILE), "4242").expect("write lock");
        let guard = LockGuard::acquire(temp.path(), &alive(&[]), true).expect("reclaim");
        let content = fs::read_to_string(guard.path()).expect("read lock");
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn stale_lock_is_kept_when_reclamation_disabled() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(LOCK_FILE), "4242").expect("write lock");
        let err = LockGuard::acquire(temp.path(), &alive(&[]), false).expect_err("stale");
        assert!(matches!(err, CacheError::StaleLock { pid: 4242 }));
        assert!(temp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn oversized_or_garbage_lock_is_corrupt() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join(LOCK_FILE);

        fs::write(&path, "1234567890").expect("write lock");
        let err = LockGuard::acquire(temp.path(), &alive(&[]), true).expect_err("corrupt");
        assert!(matches!(err, CacheError::CorruptLock { .. }));

        fs::write(&path, "pid?").expect("write lock");
        let err = LockGuard::acquire(temp.path(), &alive(&[]), true).expect_err("corrupt");
        assert!(matches!(err, CacheError::CorruptLock { .. }));
        assert!(path.exists(), "corrupt locks are never removed");
    }

    #[test]
    fn drop_releases_the_lock() {
        let temp = TempDir::new().expect("tempdir");
        let path = {
            let guard = LockGuard::acquire(temp.path(), &alive(&[]), true).expect("acquire");
            guard.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn system_probe_sees_current_process() {
        assert!(SystemProbe.is_running(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stat_state_follows_the_last_parenthesis() {
        assert!(stat_is_live("4242 (git-bugs) S 1 4242 4242 0 -1"));
        assert!(stat_is_live("4242 (a) b) R 1 4242"));
        assert!(!stat_is_live("4242 (git-bugs) Z 1 4242 4242 0 -1"));
        assert!(!stat_is_live("4242 (odd ) Z name) X 1"));
        assert!(!stat_is_live("4242 (cut"));
        assert!(!stat_is_live(""));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_probe_reports_unreaped_children_as_dead() {
        use std::time::{Duration, Instant};

        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        let deadline = Instant::now() + Duration::from_secs(10);
        while SystemProbe.is_running(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!SystemProbe.is_running(pid));
        assert!(Path::new(&format!("/proc/{pid}")).exists(), "not reaped yet");
        child.wait().expect("reap");
    }
}
