use std::sync::Arc;

use corral_core::Result;
use corral_git::GitBackend;
use tracing::{debug, info};

use crate::hook::Hook;
use crate::types::{CommittedOid, PipelineContext, Stage};

/// Pushes the branch after the commit transaction wrote a commit.
pub struct SyncHook {
    git: Arc<dyn GitBackend>,
}

impl SyncHook {
    /// Hook pushing through `git`.
    #[must_use]
    pub fn new(git: Arc<dyn GitBackend>) -> Self {
        Self { git }
    }
}

impl Hook for SyncHook {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn stage(&self) -> Stage {
        Stage::Committing
    }

    fn after(&self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        if !ctx.options().push {
            return Ok(());
        }
        let Some(CommittedOid(oid)) = ctx.state::<CommittedOid>().copied() else {
            debug!("no commit written; skipping push");
            return Ok(());
        };
        let working_copy = ctx.working_copy();
        self.git.push(&working_copy.path, working_copy.branch.as_deref())?;
        info!(%oid, "pushed commit");
        Ok(())
    }
}
