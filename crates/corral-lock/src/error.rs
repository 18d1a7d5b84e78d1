use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Failure to take a lock or a concurrency slot.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock for the whole wait.
    #[error("lock {} still held after {waited:?}", path.display())]
    Contention {
        /// Lock file or slot directory.
        path: PathBuf,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The lock file could not be created or locked.
    #[error("lock file {} unusable: {source}", path.display())]
    Io {
        /// Lock file or slot directory.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// True for a timeout, as opposed to an I/O failure.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }

    /// Path of the contended lock.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Contention { path, .. } | Self::Io { path, .. } => path,
        }
    }
}

fn resource_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || "lock".to_owned(),
        |name| name.to_string_lossy().into_owned(),
    )
}

impl From<LockError> for corral_core::Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contention { path, waited } => {
                Self::lock_contention(resource_name(&path), waited)
            }
            LockError::Io { path, source } => {
                let error = Self::internal(
                    "acquire lock",
                    None,
                    format!("{}: {source}", resource_name(&path)),
                );
                if let Some(correlation_id) = error.correlation_id() {
                    warn!(%correlation_id, path = %path.display(), error = %source, "lock file I/O failed");
                }
                error
            }
        }
    }
}

/// True when `err` reports that the lock is held elsewhere.
pub(crate) fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some()
            && err.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}
