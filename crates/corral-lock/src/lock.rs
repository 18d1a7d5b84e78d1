use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{LockError, is_contended};

/// Access mode used when acquiring a repository lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockMode {
    /// Shared; any number of readers may hold it together.
    Read,
    /// Exclusive; excludes readers and other writers.
    Write,
}

impl LockMode {
    /// Lowercase label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Guard representing a held repository lock. The lock is released when dropped.
#[derive(Debug)]
pub struct RepositoryLockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
    acquired_at: Instant,
}

impl RepositoryLockGuard {
    fn new(file: File, path: PathBuf, mode: LockMode) -> Self {
        debug!(path = %path.display(), mode = mode.as_str(), "lock acquired");
        Self {
            file,
            path,
            mode,
            acquired_at: Instant::now(),
        }
    }

    /// Mode the lock is held in.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time since the lock was taken.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Unlink the lock file while still holding it, then release.
    ///
    /// Callers that opened the old file before the unlink notice on acquisition
    /// and reopen the path, so the next holder always locks a linked file.
    pub fn release_and_remove(self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock file removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove lock file"),
        }
    }

    fn unlock(&self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(
                path = %self.path.display(),
                mode = self.mode.as_str(),
                error = %err,
                "failed to release repository lock"
            );
        } else {
            debug!(
                path = %self.path.display(),
                mode = self.mode.as_str(),
                held_ms = u64::try_from(self.held_for().as_millis()).unwrap_or(u64::MAX),
                "lock released"
            );
        }
    }
}

impl Drop for RepositoryLockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Provides helper functions for acquiring working-copy locks.
pub struct RepositoryLock;

impl RepositoryLock {
    /// Acquire a shared or exclusive lock on `lock_path`, waiting up to `timeout`.
    ///
    /// A zero timeout makes a single attempt.
    ///
    /// # Errors
    /// [`LockError::Contention`] when the lock is still held once `timeout` has
    /// elapsed, [`LockError::Io`] when the lock file cannot be opened.
    pub fn acquire(
        lock_path: &Path,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<RepositoryLockGuard, LockError> {
        let started = Instant::now();
        let mut backoff = Backoff::new();
        loop {
            match Self::try_acquire(lock_path, mode) {
                Ok(guard) => return Ok(guard),
                Err(LockError::Contention { .. }) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        debug!(path = %lock_path.display(), mode = mode.as_str(), ?waited, "lock wait timed out");
                        return Err(LockError::Contention {
                            path: lock_path.to_path_buf(),
                            waited,
                        });
                    }
                    trace!(path = %lock_path.display(), mode = mode.as_str(), "lock busy, retrying");
                    backoff.wait(timeout - waited);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Attempt to acquire the lock without blocking.
    ///
    /// # Errors
    /// [`LockError::Contention`] with a zero wait when the lock is held elsewhere.
    pub fn try_acquire(lock_path: &Path, mode: LockMode) -> Result<RepositoryLockGuard, LockError> {
        for _ in 0..RELINK_ATTEMPTS {
            let file = open_lock_file(lock_path)?;
            let result = match mode {
                LockMode::Read => fs2::FileExt::try_lock_shared(&file),
                LockMode::Write => fs2::FileExt::try_lock_exclusive(&file),
            };
            match result {
                Ok(()) if still_linked(&file, lock_path) => {
                    return Ok(RepositoryLockGuard::new(file, lock_path.to_path_buf(), mode));
                }
                Ok(()) => {
                    trace!(path = %lock_path.display(), "lock file was removed while opening; reopening");
                }
                Err(err) if is_contended(&err) => break,
                Err(source) => {
                    return Err(LockError::Io {
                        path: lock_path.to_path_buf(),
                        source,
                    });
                }
            }
        }
        Err(LockError::Contention {
            path: lock_path.to_path_buf(),
            waited: Duration::ZERO,
        })
    }
}

/// Times a lock file is reopened after finding it unlinked or its directory gone.
const RELINK_ATTEMPTS: usize = 3;

/// True when `file` is still the file linked at `path`, i.e. nobody removed or
/// replaced the path after `file` was opened.
#[cfg(unix)]
pub(crate) fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn still_linked(_file: &File, path: &Path) -> bool {
    path.is_file()
}

/// Open (creating if needed) a lock file. Each call yields a fresh file
/// description, so flock semantics also hold between threads.
pub(crate) fn open_lock_file(lock_path: &Path) -> Result<File, LockError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(parent) = lock_path.parent()
            && let Err(source) = fs::create_dir_all(parent)
        {
            return Err(LockError::Io {
                path: lock_path.to_path_buf(),
                source,
            });
        }
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
        {
            Ok(file) => return Ok(file),
            // An eviction pruned the empty parent in between; recreate it.
            Err(err) if err.kind() == io::ErrorKind::NotFound && attempt < RELINK_ATTEMPTS => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: lock_path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

const BACKOFF_START: Duration = Duration::from_millis(2);
const BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Doubling sleep between lock attempts, capped at 50ms and at the remaining wait.
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self {
            next: BACKOFF_START,
        }
    }

    pub(crate) fn wait(&mut self, remaining: Duration) {
        thread::sleep(self.next.min(remaining));
        self.next = (self.next * 2).min(BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_parent_directories() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("u1/o/r/main.lock");
        let guard = RepositoryLock::acquire(&path, LockMode::Write, Duration::ZERO)?;
        assert!(path.exists());
        assert_eq!(guard.mode(), LockMode::Write);
        assert_eq!(guard.path(), path.as_path());
        Ok(())
    }

    #[test]
    fn timeout_reports_time_waited() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("main.lock");
        let _held = RepositoryLock::acquire(&path, LockMode::Write, Duration::ZERO)?;
        let timeout = Duration::from_millis(60);
        match RepositoryLock::acquire(&path, LockMode::Read, timeout) {
            Err(LockError::Contention { waited, .. }) => assert!(waited >= timeout),
            other => panic!("expected contention, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn released_lock_can_be_retaken() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("main.lock");
        drop(RepositoryLock::acquire(&path, LockMode::Write, Duration::ZERO)?);
        let again = RepositoryLock::try_acquire(&path, LockMode::Write)?;
        assert_eq!(again.mode(), LockMode::Write);
        Ok(())
    }

    #[test]
    fn removed_lock_file_is_released_and_recreated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("main.lock");
        let guard = RepositoryLock::acquire(&path, LockMode::Write, Duration::ZERO)?;
        guard.release_and_remove();
        assert!(!path.exists());

        let again = RepositoryLock::try_acquire(&path, LockMode::Write)?;
        assert!(path.is_file());
        drop(again);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn unlinked_file_is_detected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("main.lock");
        let stale = open_lock_file(&path)?;
        assert!(still_linked(&stale, &path));

        fs::remove_file(&path)?;
        assert!(!still_linked(&stale, &path));
        let _fresh = open_lock_file(&path)?;
        assert!(!still_linked(&stale, &path));
        Ok(())
    }

    #[test]
    fn backoff_is_capped() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.wait(Duration::ZERO);
        }
        assert_eq!(backoff.next, BACKOFF_MAX);
    }
}
