#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use corral_app::{CorralConfig, ManualClock, RepositoryCache};
use corral_core::{CacheKey, Error};
use corral_git::fixtures::{DEFAULT_BRANCH, RemoteFixture};
use corral_git::{Git2Backend, Worktree};
use corral_store::FileEntryStore;
use tempfile::TempDir;
use time::macros::datetime;

struct Setup {
    temp: TempDir,
    remote: RemoteFixture,
    clock: Arc<ManualClock>,
    cache: RepositoryCache<FileEntryStore, Git2Backend>,
}

fn setup() -> Result<Setup> {
    let temp = TempDir::new()?;
    let remote = RemoteFixture::create(temp.path(), "acme", "data")?;
    // The local transport cannot serve shallow fetches, so clone everything.
    let config = CorralConfig {
        cache_root: temp.path().join("cache").join("projects"),
        default_clone_depth: Some(0),
        ..CorralConfig::default()
    };
    let store = FileEntryStore::open(config.entry_store_dir())?;
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
    let cache = RepositoryCache::new(config, store, Git2Backend::new()).with_clock(clock.clone());
    Ok(Setup {
        temp,
        remote,
        clock,
        cache,
    })
}

#[test]
fn clone_then_fetch_upstream_changes() -> Result<()> {
    let s = setup()?;
    let key = CacheKey::for_branch("u1", &s.remote.url, Some(DEFAULT_BRANCH))?;

    let entry = s.cache.get(&key, true)?;
    let path = entry.abs_path(s.cache.root());
    assert!(entry.initialized);
    assert_eq!(entry.clone_depth, None);
    assert!(path.join("README.md").is_file());
    assert!(path.starts_with(s.temp.path()));

    let upstream = s.remote.push_upstream("data/new.csv", "a,b\n")?;
    let cached = s.cache.get(&key, true)?;
    assert_eq!(cached.project_id, entry.project_id);
    assert!(!path.join("data/new.csv").exists());

    s.clock.advance(Duration::from_secs(31));
    let refreshed = s.cache.get(&key, true)?;
    assert_eq!(refreshed.project_id, entry.project_id);
    assert!(path.join("data/new.csv").is_file());
    assert_eq!(Worktree::open(&path)?.head_oid()?, Some(upstream));
    Ok(())
}

#[test]
fn default_branch_and_pinned_commit() -> Result<()> {
    let s = setup()?;
    let first = s.remote.remote_tip(DEFAULT_BRANCH)?;
    s.remote.push_upstream("later.txt", "later\n")?;

    let default = s.cache.get(&CacheKey::for_branch("u1", &s.remote.url, None)?, true)?;
    assert_eq!(default.repo_dir(s.cache.root()), s.cache.root().join("u1/local/acme/data"));
    assert!(default.key.slot_name().starts_with("default-"));
    assert!(default.abs_path(s.cache.root()).join("later.txt").is_file());

    let pinned_key = CacheKey::for_commit("u1", &s.remote.url, &first.to_string())?;
    let pinned = s.cache.get(&pinned_key, true)?;
    let worktree = Worktree::open(&pinned.abs_path(s.cache.root()))?;
    assert_eq!(worktree.head_oid()?, Some(first));
    assert!(worktree.repository().head_detached()?);
    assert!(!pinned.abs_path(s.cache.root()).join("later.txt").exists());
    Ok(())
}

#[test]
fn unknown_branch_is_a_user_error_and_leaves_nothing() -> Result<()> {
    let s = setup()?;
    let key = CacheKey::for_branch("u1", &s.remote.url, Some("does-not-exist"))?;
    let err = s.cache.get(&key, true).expect_err("branch is missing");
    assert!(matches!(err, Error::RefNotFound { .. }));
    assert!(!err.is_retryable());
    assert!(s.cache.list()?.is_empty());
    Ok(())
}

#[test]
fn entries_survive_a_new_cache_instance() -> Result<()> {
    let s = setup()?;
    let key = CacheKey::for_branch("u1", &s.remote.url, Some(DEFAULT_BRANCH))?;
    let entry = s.cache.get(&key, true)?;

    let config = s.cache.config().clone();
    let reopened = RepositoryCache::new(
        config.clone(),
        FileEntryStore::open(config.entry_store_dir())?,
        Git2Backend::new(),
    )
    .with_clock(s.clock.clone());
    assert_eq!(reopened.get(&key, true)?.project_id, entry.project_id);
    assert_eq!(reopened.list()?.len(), 1);
    Ok(())
}
