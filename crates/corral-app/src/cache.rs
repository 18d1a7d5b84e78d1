//! Repository cache: maps cache keys to ready working copies on disk.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use corral_core::{CacheEntry, CacheKey, Error, ProjectId, Result, WorkingCopy};
use corral_git::{CloneSpec, GitBackend};
use corral_lock::{ConcurrencySlots, LockMode, RepositoryLock, RepositoryLockGuard, SlotGuard};
use corral_store::EntryStore;
use tracing::{debug, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CorralConfig;
use crate::jobs::{JobRegistry, NoJobs};

/// Outcome of [`RepositoryCache::evict_expired`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries removed.
    pub evicted: Vec<ProjectId>,
    /// Expired entries kept because a job still references them.
    pub referenced: Vec<ProjectId>,
    /// Expired entries skipped because their lock was held.
    pub contended: Vec<ProjectId>,
}

impl EvictionReport {
    /// Number of entries considered expired.
    #[must_use]
    pub const fn expired(&self) -> usize {
        self.evicted.len() + self.referenced.len() + self.contended.len()
    }
}

enum Miss {
    Cloned(CacheEntry),
    Joined(CacheEntry),
}

/// Cache of git working copies shared by every caller in the process.
///
/// Each entry owns one directory under the cache root, guarded by a sibling
/// lock file; clones, fetches, unshallows and evictions all run under the
/// entry's write lock, and the store is re-read once the lock is held.
pub struct RepositoryCache<S, G> {
    config: CorralConfig,
    store: S,
    git: G,
    clock: Arc<dyn Clock>,
    jobs: Arc<dyn JobRegistry>,
}

impl<S, G> std::fmt::Debug for RepositoryCache<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCache")
            .field("cache_root", &self.config.cache_root)
            .finish_non_exhaustive()
    }
}

fn fs_error(action: &'static str, project_id: Option<ProjectId>, err: &io::Error) -> Error {
    let error = Error::internal(action, project_id, err);
    if let Some(correlation_id) = error.correlation_id() {
        warn!(%correlation_id, error = %err, "{action} failed");
    }
    error
}

fn remove_dir_if_exists(path: &Path, project_id: ProjectId) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(fs_error("remove working copy", Some(project_id), &err)),
    }
}

impl<S: EntryStore, G: GitBackend> RepositoryCache<S, G> {
    /// Cache over `store` and `git`, using the wall clock and no job registry.
    #[must_use]
    pub fn new(config: CorralConfig, store: S, git: G) -> Self {
        Self {
            config,
            store,
            git,
            clock: Arc::new(SystemClock),
            jobs: Arc::new(NoJobs),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the job registry consulted by [`Self::evict_expired`].
    #[must_use]
    pub fn with_jobs(mut self, jobs: Arc<dyn JobRegistry>) -> Self {
        self.jobs = jobs;
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CorralConfig {
        &self.config
    }

    /// Entry store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Git backend.
    #[must_use]
    pub const fn git(&self) -> &G {
        &self.git
    }

    /// Root of the working-copy tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.cache_root
    }

    /// Handle for running the pipeline on `entry`.
    #[must_use]
    pub fn handle(&self, entry: &CacheEntry) -> WorkingCopy {
        entry.handle(self.root())
    }

    /// Every cached entry, oldest first.
    ///
    /// # Errors
    /// [`Error::Store`] when the store cannot be read.
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = self.store.list()?;
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    /// Ready working copy for `key`.
    ///
    /// A miss clones (at the configured depth when `shallow`); a hit is fetched
    /// when stale and unshallowed when `shallow` is false. Entries pinned to a
    /// commit are never refreshed.
    ///
    /// # Errors
    /// [`Error::RefNotFound`] for unknown refs, [`Error::CacheRetry`] when a
    /// refresh failed and the entry was purged, [`Error::LockContention`] when
    /// the working copy stayed busy, and remote or store failures.
    pub fn get(&self, key: &CacheKey, shallow: bool) -> Result<CacheEntry> {
        let span = info_span!("cache.get", key = %key, shallow);
        let _entered = span.enter();

        if let Some(entry) = self.store.get(key)?
            && self.is_ready(&entry)
        {
            return self.refresh(entry, shallow);
        }
        match self.clone_missing(key, shallow)? {
            Miss::Cloned(entry) => Ok(entry),
            Miss::Joined(entry) => self.refresh(entry, shallow),
        }
    }

    /// Ready working copy for an existing entry.
    ///
    /// # Errors
    /// [`Error::ProjectNotFound`] when no entry exists or its working copy has
    /// disappeared (the stale record is purged); otherwise as [`Self::get`].
    pub fn get_by_id(&self, project_id: ProjectId) -> Result<CacheEntry> {
        let Some(entry) = self.store.get_by_id(project_id)? else {
            return Err(Error::ProjectNotFound(project_id));
        };
        if !self.is_ready(&entry) {
            debug!(%project_id, "working copy missing; purging record");
            self.evict(&entry)?;
            return Err(Error::ProjectNotFound(project_id));
        }
        self.refresh(entry, true)
    }

    /// Remove `entry`'s working copy and record. Already gone is success.
    ///
    /// # Errors
    /// [`Error::LockContention`] when the working copy stays busy, or a
    /// filesystem or store failure.
    pub fn evict(&self, entry: &CacheEntry) -> Result<()> {
        let lock = self.lock(entry, LockMode::Write, self.config.lock_timeout())?;
        self.purge(entry, lock)
    }

    /// Evict the entry with `project_id`; returns false when there was none.
    ///
    /// # Errors
    /// As [`Self::evict`].
    pub fn evict_by_id(&self, project_id: ProjectId) -> Result<bool> {
        let Some(entry) = self.store.get_by_id(project_id)? else {
            return Ok(false);
        };
        self.evict(&entry)?;
        Ok(true)
    }

    /// Evict every entry idle for longer than the TTL that no job references.
    ///
    /// Busy entries are skipped rather than waited for.
    ///
    /// # Errors
    /// Store, filesystem or lock I/O failures.
    pub fn evict_expired(&self) -> Result<EvictionReport> {
        let ttl = self.config.cache_ttl();
        let mut report = EvictionReport::default();
        for entry in self.store.list()? {
            if !entry.is_expired(self.clock.now(), ttl) {
                continue;
            }
            if self.jobs.is_referenced(entry.project_id) {
                debug!(project_id = %entry.project_id, "expired entry still in use");
                report.referenced.push(entry.project_id);
                continue;
            }
            let lock = match RepositoryLock::try_acquire(&entry.lock_path(self.root()), LockMode::Write) {
                Ok(guard) => guard,
                Err(err) if err.is_contention() => {
                    debug!(project_id = %entry.project_id, "expired entry busy; skipping");
                    report.contended.push(entry.project_id);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            // A client may have touched the entry before we got the lock.
            let Some(current) = self.store.get_by_id(entry.project_id)? else {
                continue;
            };
            if !current.is_expired(self.clock.now(), ttl) {
                continue;
            }
            self.purge(&current, lock)?;
            report.evicted.push(current.project_id);
        }
        info!(
            evicted = report.evicted.len(),
            referenced = report.referenced.len(),
            contended = report.contended.len(),
            "expired entries processed"
        );
        Ok(report)
    }

    fn is_ready(&self, entry: &CacheEntry) -> bool {
        entry.initialized && entry.abs_path(self.root()).is_dir()
    }

    fn lock(&self, entry: &CacheEntry, mode: LockMode, timeout: Duration) -> Result<RepositoryLockGuard> {
        Ok(RepositoryLock::acquire(&entry.lock_path(self.root()), mode, timeout)?)
    }

    fn slot(&self, entry: &CacheEntry) -> Result<SlotGuard> {
        let slots = ConcurrencySlots::new(entry.slots_dir(self.root()), self.config.max_concurrent_operations);
        Ok(slots.acquire(self.config.lock_timeout())?)
    }

    fn refresh(&self, mut entry: CacheEntry, shallow: bool) -> Result<CacheEntry> {
        if entry.is_fetch_stale(self.clock.now(), self.config.fetch_threshold()) {
            entry = self.fetch_stale(&entry)?;
        }
        if !shallow && entry.is_shallow() && !entry.key.is_detached() {
            entry = self.unshallow(&entry)?;
        }
        self.touch(entry)
    }

    fn touch(&self, entry: CacheEntry) -> Result<CacheEntry> {
        match self.store.touch(entry.project_id, self.clock.now())? {
            Some(entry) => Ok(entry),
            None => Err(Error::CacheRetry {
                project_id: entry.project_id,
                reason: "entry was evicted concurrently".to_owned(),
            }),
        }
    }

    fn reread(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        self.store
            .get_by_id(entry.project_id)?
            .ok_or_else(|| Error::CacheRetry {
                project_id: entry.project_id,
                reason: "entry was evicted concurrently".to_owned(),
            })
    }

    fn fetch_stale(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let slot = self.slot(entry)?;
        let lock = self.lock(entry, LockMode::Write, self.config.lock_timeout())?;
        let mut current = self.reread(entry)?;
        if !current.is_fetch_stale(self.clock.now(), self.config.fetch_threshold()) {
            debug!(project_id = %current.project_id, "refreshed by another caller");
            return Ok(current);
        }

        let path = current.abs_path(self.root());
        if let Err(err) = self.git.fetch(&path, current.key.branch.as_deref()) {
            warn!(project_id = %current.project_id, error = %err, "fetch failed; purging entry");
            drop(slot);
            self.purge(&current, lock)?;
            return Err(Error::CacheRetry {
                project_id: current.project_id,
                reason: err.to_string(),
            });
        }
        current.last_fetched_at = self.clock.now();
        self.store.put(&current)?;
        info!(project_id = %current.project_id, "working copy refreshed");
        Ok(current)
    }

    fn unshallow(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let _slot = self.slot(entry)?;
        let _lock = self.lock(entry, LockMode::Write, self.config.lock_timeout())?;
        let mut current = self.reread(entry)?;
        if !current.is_shallow() {
            return Ok(current);
        }

        let path = current.abs_path(self.root());
        self.git.unshallow(&path, current.key.branch.as_deref())?;
        current.clone_depth = None;
        current.last_fetched_at = self.clock.now();
        self.store.put(&current)?;
        info!(project_id = %current.project_id, "working copy unshallowed");
        Ok(current)
    }

    fn clone_missing(&self, key: &CacheKey, shallow: bool) -> Result<Miss> {
        let depth = if shallow { self.config.clone_depth() } else { None };
        let mut pending = CacheEntry::pending(key.clone(), depth, self.clock.now());
        let path = pending.abs_path(self.root());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| fs_error("create cache directory", Some(pending.project_id), &err))?;
        }

        let _slot = self.slot(&pending)?;
        let _lock = self.lock(&pending, LockMode::Write, self.config.lock_timeout())?;
        if let Some(existing) = self.store.get(key)? {
            if self.is_ready(&existing) {
                debug!(project_id = %existing.project_id, "concurrent clone finished first");
                return Ok(Miss::Joined(existing));
            }
            debug!(project_id = %existing.project_id, "dropping record without working copy");
            self.store.delete(existing.project_id)?;
        }

        remove_dir_if_exists(&path, pending.project_id)?;
        if let Err(err) = self.git.clone_repo(&key.remote_url, &path, &CloneSpec::for_key(key, depth)) {
            if let Err(cleanup) = remove_dir_if_exists(&path, pending.project_id) {
                warn!(error = %cleanup, "failed to remove partial clone");
            }
            return Err(err);
        }

        let now = self.clock.now();
        pending.initialized = true;
        pending.accessed_at = now;
        pending.last_fetched_at = now;
        if let Some(winner) = self.store.insert_if_absent(&pending)? {
            warn!(project_id = %winner.project_id, "entry stored by another writer; using it");
            return Ok(Miss::Joined(winner));
        }
        info!(project_id = %pending.project_id, depth = ?depth, "working copy cloned");
        Ok(Miss::Cloned(pending))
    }

    /// Delete the working copy and the record, then the lock file, the idle
    /// slot directory and any parent directories left empty.
    fn purge(&self, entry: &CacheEntry, lock: RepositoryLockGuard) -> Result<()> {
        remove_dir_if_exists(&entry.abs_path(self.root()), entry.project_id)?;
        if self.store.delete(entry.project_id)? {
            info!(project_id = %entry.project_id, "entry evicted");
        } else {
            debug!(project_id = %entry.project_id, "entry already gone");
        }

        let slots = ConcurrencySlots::new(entry.slots_dir(self.root()), self.config.max_concurrent_operations);
        if let Err(err) = slots.remove_if_idle() {
            warn!(project_id = %entry.project_id, error = %err, "failed to remove slot directory");
        }
        lock.release_and_remove();
        self.prune_empty_parents(&entry.repo_dir(self.root()));
        Ok(())
    }

    /// Remove `dir` and its ancestors below the cache root while they are empty.
    fn prune_empty_parents(&self, dir: &Path) {
        let root = self.root();
        let mut current = Some(dir);
        while let Some(dir) = current.filter(|dir| *dir != root && dir.starts_with(root)) {
            match fs::remove_dir(dir) {
                Ok(()) => debug!(dir = %dir.display(), "pruned empty cache directory"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(_) => break,
            }
            current = dir.parent();
        }
    }
}
