use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{LockError, is_contended};
use crate::lock::{Backoff, open_lock_file, still_linked};

/// Bounded set of slot files limiting how many clones or fetches run at once
/// against one working copy.
///
/// There is no fairness: a waiter polls every slot and takes the first free one.
#[derive(Clone, Debug)]
pub struct ConcurrencySlots {
    dir: PathBuf,
    capacity: usize,
}

/// A held slot. Released when dropped.
#[derive(Debug)]
pub struct SlotGuard {
    file: File,
    index: usize,
    path: PathBuf,
}

impl SlotGuard {
    /// Index of the slot file in use.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release concurrency slot");
        }
    }
}

impl ConcurrencySlots {
    /// Slots stored as `slot-<i>.lock` under `dir`. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            capacity: capacity.max(1),
        }
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Directory holding the slot files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take any free slot, waiting up to `timeout`.
    ///
    /// # Errors
    /// [`LockError::Contention`] when every slot stayed busy for the whole wait,
    /// [`LockError::Io`] when a slot file cannot be opened.
    pub fn acquire(&self, timeout: Duration) -> Result<SlotGuard, LockError> {
        let started = Instant::now();
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                debug!(dir = %self.dir.display(), capacity = self.capacity, ?waited, "no free concurrency slot");
                return Err(LockError::Contention {
                    path: self.dir.clone(),
                    waited,
                });
            }
            backoff.wait(timeout - waited);
        }
    }

    /// Take a free slot if there is one.
    ///
    /// # Errors
    /// [`LockError::Io`] when a slot file cannot be opened or locked.
    pub fn try_acquire(&self) -> Result<Option<SlotGuard>, LockError> {
        for index in 0..self.capacity {
            let path = self.dir.join(format!("slot-{index}.lock"));
            let file = open_lock_file(&path)?;
            match fs2::FileExt::try_lock_exclusive(&file) {
                // A slot file unlinked by `remove_if_idle` counts as busy; the
                // next poll reopens the path.
                Ok(()) if still_linked(&file, &path) => {
                    debug!(dir = %self.dir.display(), index, "concurrency slot acquired");
                    return Ok(Some(SlotGuard { file, index, path }));
                }
                Ok(()) => {}
                Err(err) if is_contended(&err) => {}
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
        Ok(None)
    }

    /// Delete the slot directory when no slot is held.
    ///
    /// Every slot file is locked before it is unlinked, so a held slot is never
    /// removed from under its holder. Returns false when a slot was busy or a
    /// new slot appeared meanwhile; the directory is then left in place.
    ///
    /// # Errors
    /// [`LockError::Io`] when the directory cannot be read or a slot file cannot
    /// be locked or removed.
    pub fn remove_if_idle(&self) -> Result<bool, LockError> {
        let io_err = |source| LockError::Io {
            path: self.dir.clone(),
            source,
        };
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(io_err(err)),
        };

        let mut held = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_err)?.path();
            let file = open_lock_file(&path)?;
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => held.push((path, file)),
                Err(err) if is_contended(&err) => {
                    debug!(dir = %self.dir.display(), "slot busy; keeping slot directory");
                    return Ok(false);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
        for (path, _file) in &held {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        match fs::remove_dir(&self.dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => {
                debug!(dir = %self.dir.display(), error = %err, "slot directory not removed");
                Ok(false)
            }
        }
    }
}
