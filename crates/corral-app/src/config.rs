//! Service configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use corral_hooks::PipelineConfig;
use serde::{Deserialize, Serialize};

/// Overrides the cache root directory.
pub const ENV_CACHE_ROOT: &str = "CORRAL_CACHE_ROOT";
/// Overrides the default clone depth (`0` clones full history).
pub const ENV_CLONE_DEPTH: &str = "CORRAL_CLONE_DEPTH";
/// Overrides the fetch-staleness threshold, in seconds.
pub const ENV_FETCH_THRESHOLD: &str = "CORRAL_FETCH_THRESHOLD";
/// Overrides the cache entry TTL, in seconds.
pub const ENV_CACHE_TTL: &str = "CORRAL_CACHE_TTL";
/// Overrides the lock timeout, in seconds.
pub const ENV_LOCK_TIMEOUT: &str = "CORRAL_LOCK_TIMEOUT";
/// Overrides the concurrency-slot capacity.
pub const ENV_MAX_CONCURRENT: &str = "CORRAL_MAX_CONCURRENT";

const FALLBACK_CACHE_ROOT: &str = ".corral-cache";

/// Top-level configuration, usually loaded from `corral.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    /// Root of the working-copy tree.
    pub cache_root: PathBuf,

    /// Directory of the cache entry records; next to the cache root when unset.
    pub entry_store_dir: Option<PathBuf>,

    /// Depth of shallow clones; `0` means full history.
    pub default_clone_depth: Option<u32>,

    /// Age after which a branch-tracking entry is fetched again.
    pub fetch_threshold_secs: u64,

    /// Idle time after which an entry may be evicted.
    pub cache_ttl_secs: u64,

    /// Wait limit for locks and concurrency slots.
    pub lock_timeout_secs: u64,

    /// Heavy operations (clone, fetch) allowed at once per working copy.
    pub max_concurrent_operations: usize,

    /// Author name on pipeline commits.
    pub commit_author_name: String,

    /// Author email on pipeline commits.
    pub commit_author_email: String,

    /// Built-in pipeline hooks to leave out.
    pub disabled_hooks: Vec<String>,
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || PathBuf::from(FALLBACK_CACHE_ROOT),
        |dir| dir.join("corral").join("projects"),
    )
}

impl Default for CorralConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            cache_root: default_cache_root(),
            entry_store_dir: None,
            default_clone_depth: Some(1),
            fetch_threshold_secs: 30,
            cache_ttl_secs: 30 * 60,
            lock_timeout_secs: pipeline.lock_timeout_secs,
            max_concurrent_operations: 4,
            commit_author_name: pipeline.commit_author_name,
            commit_author_email: pipeline.commit_author_email,
            disabled_hooks: pipeline.disabled,
        }
    }
}

impl CorralConfig {
    /// Load `path`, falling back to defaults when it does not exist.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or fails
    /// [`CorralConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// [`CorralConfig::load`] followed by the `CORRAL_*` environment overrides.
    ///
    /// # Errors
    /// Same as [`CorralConfig::load`], plus unparsable override values.
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load(path)?;
        let mut fetch = |key: &'static str| std::env::var(key).ok();
        config.apply_env_with(&mut fetch)?;
        Ok(config)
    }

    /// Apply overrides looked up through `fetch`; blank values are ignored.
    ///
    /// # Errors
    /// Returns an error naming the variable when a value does not parse or the
    /// result fails validation.
    pub fn apply_env_with(
        &mut self,
        fetch: &mut impl FnMut(&'static str) -> Option<String>,
    ) -> Result<()> {
        let mut value = |key: &'static str| fetch(key).filter(|value| !value.trim().is_empty());

        if let Some(root) = value(ENV_CACHE_ROOT) {
            self.cache_root = PathBuf::from(root.trim());
        }
        if let Some(depth) = value(ENV_CLONE_DEPTH) {
            self.default_clone_depth = Some(parse_env(ENV_CLONE_DEPTH, &depth)?);
        }
        if let Some(secs) = value(ENV_FETCH_THRESHOLD) {
            self.fetch_threshold_secs = parse_env(ENV_FETCH_THRESHOLD, &secs)?;
        }
        if let Some(secs) = value(ENV_CACHE_TTL) {
            self.cache_ttl_secs = parse_env(ENV_CACHE_TTL, &secs)?;
        }
        if let Some(secs) = value(ENV_LOCK_TIMEOUT) {
            self.lock_timeout_secs = parse_env(ENV_LOCK_TIMEOUT, &secs)?;
        }
        if let Some(max) = value(ENV_MAX_CONCURRENT) {
            self.max_concurrent_operations = parse_env(ENV_MAX_CONCURRENT, &max)?;
        }
        self.validate()
    }

    /// Reject settings the cache cannot work with.
    ///
    /// # Errors
    /// Returns an error for a zero lock timeout, zero slot capacity or an empty
    /// cache root.
    pub fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            bail!("cache_root must not be empty");
        }
        if self.lock_timeout_secs == 0 {
            bail!("lock_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_operations == 0 {
            bail!("max_concurrent_operations must be greater than zero");
        }
        Ok(())
    }

    /// Depth used for shallow clones; `None` clones everything.
    #[must_use]
    pub fn clone_depth(&self) -> Option<u32> {
        self.default_clone_depth.filter(|depth| *depth > 0)
    }

    /// Fetch-staleness threshold.
    #[must_use]
    pub const fn fetch_threshold(&self) -> Duration {
        Duration::from_secs(self.fetch_threshold_secs)
    }

    /// Idle time after which an entry expires.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Lock and slot wait limit.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Where cache entry records live.
    #[must_use]
    pub fn entry_store_dir(&self) -> PathBuf {
        self.entry_store_dir.clone().unwrap_or_else(|| {
            self.cache_root
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| self.cache_root.join(".entries"), |parent| parent.join("entries"))
        })
    }

    /// Settings for the standard hook pipeline.
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            lock_timeout_secs: self.lock_timeout_secs,
            commit_author_name: self.commit_author_name.clone(),
            commit_author_email: self.commit_author_email.clone(),
            disabled: self.disabled_hooks.clone(),
        }
    }
}

fn parse_env<T>(key: &'static str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got '{value}'"))
}
