#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use corral_app::{CorralConfig, ManualClock, RepositoryCache};
use corral_core::{Error, Result};
use corral_git::fixtures::{commit_file, init_repo};
use corral_git::{CloneSpec, GitBackend};
use corral_store::MemoryEntryStore;
use tempfile::TempDir;
use time::macros::datetime;

/// Git backend that creates local repositories instead of talking to a remote,
/// counting every call.
#[derive(Debug, Default)]
pub struct CountingGit {
    pub clones: AtomicUsize,
    pub fetches: AtomicUsize,
    pub unshallows: AtomicUsize,
    pub pushes: AtomicUsize,
    pub fail_fetch: AtomicBool,
    pub clone_delay: Duration,
}

impl CountingGit {
    pub fn slow(clone_delay: Duration) -> Self {
        Self {
            clone_delay,
            ..Self::default()
        }
    }

    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn unshallows(&self) -> usize {
        self.unshallows.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

fn local(err: impl std::fmt::Display) -> Error {
    Error::internal("mock git", None, err)
}

impl GitBackend for CountingGit {
    fn clone_repo(&self, url: &str, target: &Path, spec: &CloneSpec) -> Result<()> {
        if url.ends_with("/missing") {
            return Err(Error::RefNotFound {
                reference: spec.branch.clone().unwrap_or_default(),
            });
        }
        self.clones.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.clone_delay);
        fs::create_dir_all(target).map_err(local)?;
        let repo = init_repo(target).map_err(local)?;
        commit_file(&repo, "README.md", "# cached\n", "initial commit").map_err(local)?;
        Ok(())
    }

    fn fetch(&self, _workdir: &Path, _branch: Option<&str>) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::remote("https://user:secret@h/o/r", "connection reset"));
        }
        Ok(())
    }

    fn unshallow(&self, _workdir: &Path, _branch: Option<&str>) -> Result<()> {
        self.unshallows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push(&self, _workdir: &Path, _branch: Option<&str>) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub type MockCache = RepositoryCache<Arc<MemoryEntryStore>, Arc<CountingGit>>;

pub struct Harness {
    pub temp: TempDir,
    pub git: Arc<CountingGit>,
    pub store: Arc<MemoryEntryStore>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<MockCache>,
}

pub fn config(root: &Path) -> CorralConfig {
    CorralConfig {
        cache_root: root.join("projects"),
        lock_timeout_secs: 10,
        ..CorralConfig::default()
    }
}

pub fn harness_with(git: CountingGit) -> anyhow::Result<Harness> {
    let temp = TempDir::new()?;
    let git = Arc::new(git);
    let store = Arc::new(MemoryEntryStore::new());
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
    let cache = RepositoryCache::new(config(temp.path()), Arc::clone(&store), Arc::clone(&git))
        .with_clock(clock.clone());
    Ok(Harness {
        temp,
        git,
        store,
        clock,
        cache: Arc::new(cache),
    })
}

pub fn harness() -> anyhow::Result<Harness> {
    harness_with(CountingGit::default())
}
