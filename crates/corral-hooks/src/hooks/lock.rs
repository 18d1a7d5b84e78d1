use std::time::Duration;

use corral_core::{Error, Result};
use corral_lock::{LockMode, RepositoryLock};
use tracing::debug;

use crate::hook::Hook;
use crate::types::{PipelineContext, Stage};

/// Takes the working-copy lock in the mode the run asks for.
///
/// Dataset-scoped and project-scoped operations share this one lock.
#[derive(Debug, Clone, Copy)]
pub struct LockHook {
    timeout: Duration,
}

impl LockHook {
    /// Hook waiting up to `timeout` unless the run overrides it.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Hook for LockHook {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn stage(&self) -> Stage {
        Stage::Locked
    }

    fn before(&self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let mode = ctx.options().lock;
        let timeout = ctx.options().lock_timeout.unwrap_or(self.timeout);
        let lock_path = &ctx.working_copy().lock_path;
        let guard = RepositoryLock::acquire(lock_path, mode, timeout).map_err(Error::from)?;
        debug!(mode = mode.as_str(), path = %lock_path.display(), "working copy locked");
        let label = match mode {
            LockMode::Read => "release read lock",
            LockMode::Write => "release write lock",
        };
        ctx.push_exit(label, move || drop(guard));
        ctx.advance(Stage::Locked);
        Ok(())
    }
}
