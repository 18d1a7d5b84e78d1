use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use corral_core::{Error, Result};
use git2::{Commit, ErrorCode, IndexAddOption, Oid, Repository, Signature, Status, StatusOptions};
use tracing::{debug, info};

use crate::error::local_failure;

/// Commit to write from the working copy state.
#[derive(Clone, Debug, Default)]
pub struct CommitRequest {
    /// Commit message.
    pub message: String,
    /// Paths (files or directories, relative to the root) to stage; everything
    /// when `None`, nothing when empty.
    pub paths: Option<Vec<String>>,
    /// Write the commit even if the tree is unchanged.
    pub allow_empty: bool,
}

/// Local operations on a cached working copy.
pub struct Worktree {
    repo: Repository,
    root: PathBuf,
}

impl std::fmt::Debug for Worktree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worktree").field("root", &self.root).finish_non_exhaustive()
    }
}

impl Worktree {
    /// Open the working copy rooted at `path`.
    ///
    /// # Errors
    /// [`Error::Internal`] when `path` is not a git working copy.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path).map_err(|err| local_failure("open working copy", &err))?;
        Ok(Self {
            repo,
            root: path.to_path_buf(),
        })
    }

    /// Working copy root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Underlying repository.
    #[must_use]
    pub const fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Paths that differ from HEAD, including untracked files but not ignored ones.
    ///
    /// # Errors
    /// [`Error::Internal`] when the status cannot be computed.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .renames_head_to_index(true);
        let statuses = self
            .repo
            .statuses(Some(&mut options))
            .map_err(|err| local_failure("read status", &err))?;

        let mut paths = BTreeSet::new();
        for entry in statuses.iter() {
            if entry.status() == Status::CURRENT || entry.status().contains(Status::IGNORED) {
                continue;
            }
            let old = entry.head_to_index().and_then(|delta| delta.old_file().path());
            let new = entry
                .index_to_workdir()
                .and_then(|delta| delta.new_file().path())
                .or_else(|| entry.head_to_index().and_then(|delta| delta.new_file().path()));
            for path in [old, new].into_iter().flatten() {
                paths.insert(path.to_string_lossy().into_owned());
            }
            if let Some(path) = entry.path() {
                paths.insert(path.to_owned());
            }
        }
        Ok(paths.into_iter().collect())
    }

    /// True when nothing differs from HEAD.
    ///
    /// # Errors
    /// [`Error::Internal`] when the status cannot be computed.
    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.changed_paths()?.is_empty())
    }

    /// Commit HEAD points at; `None` on an unborn branch.
    ///
    /// # Errors
    /// [`Error::Internal`] when HEAD cannot be read.
    pub fn head_oid(&self) -> Result<Option<Oid>> {
        match self.repo.head() {
            Ok(head) => Ok(head.target()),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(err) => Err(local_failure("read HEAD", &err)),
        }
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        let Some(oid) = self.head_oid()? else {
            return Ok(None);
        };
        self.repo
            .find_commit(oid)
            .map(Some)
            .map_err(|err| local_failure("read HEAD commit", &err))
    }

    /// Stage the requested paths and write one commit on HEAD.
    ///
    /// # Errors
    /// [`Error::NothingToCommit`] when the staged tree equals HEAD's tree and
    /// `allow_empty` is false; [`Error::Internal`] for git failures.
    pub fn commit(&self, request: &CommitRequest, signature: &Signature<'_>) -> Result<Oid> {
        let pathspecs: Vec<&str> = request
            .paths
            .as_ref()
            .map_or_else(|| vec!["*"], |paths| paths.iter().map(String::as_str).collect());

        let mut index = self.repo.index().map_err(|err| local_failure("open index", &err))?;
        // An empty pathspec matches everything in libgit2; an empty list stages nothing.
        if !pathspecs.is_empty() {
            index
                .add_all(pathspecs.iter().copied(), IndexAddOption::DEFAULT, None)
                .and_then(|()| index.update_all(pathspecs.iter().copied(), None))
                .map_err(|err| local_failure("stage changes", &err))?;
        }
        let tree_oid = index
            .write_tree()
            .map_err(|err| local_failure("write tree", &err))?;

        let parent = self.head_commit()?;
        let unchanged = parent.as_ref().map_or_else(
            || self.repo.find_tree(tree_oid).is_ok_and(|tree| tree.is_empty()),
            |parent| parent.tree_id() == tree_oid,
        );
        if unchanged && !request.allow_empty {
            debug!(root = %self.root.display(), "tree unchanged; nothing to commit");
            return Err(Error::NothingToCommit);
        }

        index.write().map_err(|err| local_failure("write index", &err))?;
        let tree = self
            .repo
            .find_tree(tree_oid)
            .map_err(|err| local_failure("load tree", &err))?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), signature, signature, &request.message, &tree, &parents)
            .map_err(|err| local_failure("write commit", &err))?;
        info!(%oid, root = %self.root.display(), "committed working copy changes");
        Ok(oid)
    }

    /// Number of commits reachable from HEAD.
    ///
    /// # Errors
    /// [`Error::Internal`] when history cannot be walked.
    pub fn commit_count(&self) -> Result<usize> {
        if self.head_oid()?.is_none() {
            return Ok(0);
        }
        let mut walk = self
            .repo
            .revwalk()
            .map_err(|err| local_failure("walk history", &err))?;
        walk.push_head()
            .map_err(|err| local_failure("walk history", &err))?;
        Ok(walk.count())
    }

    /// True when the working copy has truncated history.
    #[must_use]
    pub fn is_shallow(&self) -> bool {
        self.repo.is_shallow()
    }
}

/// Build a commit signature stamped with the current time.
///
/// # Errors
/// [`Error::Validation`] when the name or email is rejected by git.
pub fn signature(name: &str, email: &str) -> Result<Signature<'static>> {
    Signature::now(name, email).map_err(|err| Error::validation("commit_author", err.message()))
}
