use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::id::ProjectId;
use crate::key::CacheKey;

/// Persisted record describing one cached working copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Stable id handed out to clients.
    pub project_id: ProjectId,
    /// Identity of the slot.
    pub key: CacheKey,
    /// History depth of the clone; `None` means full history.
    pub clone_depth: Option<u32>,
    /// False until the clone has completed.
    pub initialized: bool,
    /// When the slot was first populated.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last time a client acquired the slot.
    #[serde(with = "time::serde::rfc3339")]
    pub accessed_at: OffsetDateTime,
    /// Last successful clone or fetch.
    #[serde(with = "time::serde::rfc3339")]
    pub last_fetched_at: OffsetDateTime,
}

impl CacheEntry {
    /// New entry for `key` that has not been cloned or stored yet.
    #[must_use]
    pub fn pending(key: CacheKey, clone_depth: Option<u32>, now: OffsetDateTime) -> Self {
        Self {
            project_id: ProjectId::new(),
            key,
            clone_depth,
            initialized: false,
            created_at: now,
            accessed_at: now,
            last_fetched_at: now,
        }
    }

    /// Working copy directory: `<root>/<repo-dir>/<slot-name>` (see
    /// [`CacheKey::repo_dir`] and [`CacheKey::slot_name`]).
    #[must_use]
    pub fn abs_path(&self, root: &Path) -> PathBuf {
        self.repo_dir(root).join(self.key.slot_name())
    }

    /// Directory shared by every slot of the same remote and owner.
    #[must_use]
    pub fn repo_dir(&self, root: &Path) -> PathBuf {
        root.join(self.key.repo_dir())
    }

    /// Lock file guarding the working copy; lives next to it so it survives
    /// removal of the working copy directory.
    #[must_use]
    pub fn lock_path(&self, root: &Path) -> PathBuf {
        self.sibling(root, "lock")
    }

    /// Directory holding the concurrency slot files for this working copy.
    #[must_use]
    pub fn slots_dir(&self, root: &Path) -> PathBuf {
        self.sibling(root, "slots")
    }

    fn sibling(&self, root: &Path, suffix: &str) -> PathBuf {
        self.repo_dir(root)
            .join(format!("{}.{suffix}", self.key.slot_name()))
    }

    /// True when a branch-tracking entry has not been fetched within `threshold`.
    #[must_use]
    pub fn is_fetch_stale(&self, now: OffsetDateTime, threshold: Duration) -> bool {
        !self.key.is_detached() && elapsed(self.last_fetched_at, now) >= threshold
    }

    /// Time since the last client access.
    #[must_use]
    pub fn idle_for(&self, now: OffsetDateTime) -> Duration {
        elapsed(self.accessed_at, now)
    }

    /// True when the entry has been idle for longer than `ttl`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        self.idle_for(now) > ttl
    }

    /// True when the clone has truncated history.
    #[must_use]
    pub const fn is_shallow(&self) -> bool {
        self.clone_depth.is_some()
    }

    /// Handle passed to the pipeline.
    #[must_use]
    pub fn handle(&self, root: &Path) -> WorkingCopy {
        WorkingCopy {
            project_id: self.project_id,
            path: self.abs_path(root),
            lock_path: self.lock_path(root),
            branch: self.key.branch.clone(),
        }
    }
}

/// Location of a working copy on disk plus the lock that guards it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingCopy {
    /// Project the working copy belongs to.
    pub project_id: ProjectId,
    /// Working tree root.
    pub path: PathBuf,
    /// Lock file for [`Self::path`].
    pub lock_path: PathBuf,
    /// Branch to push to after a commit, if any.
    pub branch: Option<String>,
}

fn elapsed(since: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::try_from(now - since).unwrap_or(Duration::ZERO)
}
