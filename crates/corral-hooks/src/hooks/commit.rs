use std::collections::BTreeSet;

use corral_core::{Error, Result};
use corral_git::CommitRequest;
use tracing::{debug, info};

use crate::hook::Hook;
use crate::types::{CleanBefore, CommitPolicy, CommittedOid, PipelineContext, Stage};

/// Turns what the operation body wrote into exactly one commit.
///
/// Pre-work records (and, when asked, enforces) cleanliness; post-work commits
/// according to the run's [`CommitPolicy`]. A body that fails never reaches
/// post-work, so a failed run leaves no commit behind. Paths that were already
/// dirty before the body ran are never staged, so leftovers of an earlier
/// failed run stay out of this run's commit.
#[derive(Debug, Clone)]
pub struct CommitTransaction {
    author_name: String,
    author_email: String,
}

impl CommitTransaction {
    /// Transaction committing as `author_name <author_email>`.
    #[must_use]
    pub const fn new(author_name: String, author_email: String) -> Self {
        Self {
            author_name,
            author_email,
        }
    }
}

/// True when `path` equals an allow-list entry or lies below one.
fn is_allowed(path: &str, allow: &[String]) -> bool {
    allow.iter().any(|entry| {
        let entry = entry.trim_end_matches('/');
        entry.is_empty()
            || entry == "."
            || path == entry
            || path
                .strip_prefix(entry)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

impl Hook for CommitTransaction {
    fn name(&self) -> &'static str {
        "commit"
    }

    fn stage(&self) -> Stage {
        Stage::Committing
    }

    fn before(&self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let options = ctx.options();
        if !options.requires_clean && options.commit == CommitPolicy::Never {
            return Ok(());
        }
        let requires_clean = options.requires_clean;
        let dirty_paths = ctx.worktree()?.changed_paths()?;
        if requires_clean && !dirty_paths.is_empty() {
            debug!(dirty = dirty_paths.len(), "working copy is dirty");
            return Err(Error::RepositoryNotClean { paths: dirty_paths });
        }
        ctx.insert_state(CleanBefore { dirty_paths });
        Ok(())
    }

    fn after(&self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let policy = ctx.options().commit;
        if policy == CommitPolicy::Never {
            return Ok(());
        }
        ctx.advance(Stage::Committing);

        let allow = ctx.options().commit_paths.clone();
        let worktree = ctx.worktree()?;
        let mut changed = worktree.changed_paths()?;
        if let Some(allow) = &allow {
            changed.retain(|path| is_allowed(path, allow));
        }
        if let Some(before) = ctx.state::<CleanBefore>()
            && !before.dirty_paths.is_empty()
        {
            let preexisting: BTreeSet<&str> = before.dirty_paths.iter().map(String::as_str).collect();
            let total = changed.len();
            changed.retain(|path| !preexisting.contains(path.as_str()));
            if changed.len() < total {
                debug!(skipped = total - changed.len(), "leaving paths dirty before the run unstaged");
            }
        }
        if changed.is_empty() {
            match policy {
                CommitPolicy::IfChanged | CommitPolicy::Never => {
                    debug!("nothing changed; no commit");
                    return Ok(());
                }
                CommitPolicy::RequireChanges => return Err(Error::NothingToCommit),
                CommitPolicy::Always => {}
            }
        }

        let files = changed.len();
        let request = CommitRequest {
            message: ctx.options().effective_commit_message(),
            paths: Some(changed),
            allow_empty: policy == CommitPolicy::Always,
        };
        let signature = corral_git::signature(&self.author_name, &self.author_email)?;
        let oid = match worktree.commit(&request, &signature) {
            Ok(oid) => oid,
            Err(Error::NothingToCommit) if policy == CommitPolicy::IfChanged => {
                debug!("staged tree unchanged; no commit");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        info!(%oid, files, "operation committed");
        ctx.insert_state(CommittedOid(oid));
        Ok(())
    }
}
