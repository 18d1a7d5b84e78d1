use std::path::Path;
use std::sync::Arc;

use corral_core::{CacheKey, Error, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, CredentialType, FetchOptions, PushOptions, Remote, RemoteCallbacks, Repository,
    ResetType,
};
use tracing::{debug, info};

use crate::error::{local_failure, remote_failure};

const ORIGIN: &str = "origin";
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;
/// libgit2's marker depth meaning "fetch the complete history".
const UNSHALLOW_DEPTH: i32 = i32::MAX;

/// What to clone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloneSpec {
    /// Branch to check out; the remote default when `None`.
    pub branch: Option<String>,
    /// Commit to check out detached.
    pub commit: Option<String>,
    /// History depth; `None` clones everything.
    pub depth: Option<u32>,
}

impl CloneSpec {
    /// Clone settings for the ref named by `key`.
    #[must_use]
    pub fn for_key(key: &CacheKey, depth: Option<u32>) -> Self {
        Self {
            branch: key.branch.clone(),
            commit: key.commit_sha.clone(),
            depth,
        }
    }
}

/// Operations that talk to the remote.
///
/// The cache only goes through this trait, so tests can count or fail calls
/// without a network.
pub trait GitBackend: Send + Sync {
    /// Clone `url` into `target` (which must not exist or be empty).
    ///
    /// # Errors
    /// [`Error::RefNotFound`] when the branch or commit does not exist,
    /// [`Error::Remote`] for other remote failures.
    fn clone_repo(&self, url: &str, target: &Path, spec: &CloneSpec) -> Result<()>;

    /// Fetch the tracked branch and hard-reset the working copy to its tip.
    ///
    /// # Errors
    /// [`Error::Remote`] when the fetch fails.
    fn fetch(&self, workdir: &Path, branch: Option<&str>) -> Result<()>;

    /// Fetch complete history for a shallow working copy, then hard-reset.
    ///
    /// # Errors
    /// [`Error::Remote`] when the fetch fails.
    fn unshallow(&self, workdir: &Path, branch: Option<&str>) -> Result<()>;

    /// Push the local branch to the remote branch of the same name.
    ///
    /// # Errors
    /// [`Error::Remote`] when the push fails or is rejected.
    fn push(&self, workdir: &Path, branch: Option<&str>) -> Result<()>;
}

impl<T: GitBackend + ?Sized> GitBackend for Arc<T> {
    fn clone_repo(&self, url: &str, target: &Path, spec: &CloneSpec) -> Result<()> {
        (**self).clone_repo(url, target, spec)
    }

    fn fetch(&self, workdir: &Path, branch: Option<&str>) -> Result<()> {
        (**self).fetch(workdir, branch)
    }

    fn unshallow(&self, workdir: &Path, branch: Option<&str>) -> Result<()> {
        (**self).unshallow(workdir, branch)
    }

    fn push(&self, workdir: &Path, branch: Option<&str>) -> Result<()> {
        (**self).push(workdir, branch)
    }
}

/// [`GitBackend`] built on libgit2.
///
/// Credentials come from the ssh agent and the user's git credential helpers.
#[derive(Clone, Copy, Debug, Default)]
pub struct Git2Backend;

impl Git2Backend {
    /// Create the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn remote_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |url, username, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.contains(CredentialType::SSH_KEY)
            && let Some(username) = username
        {
            return Cred::ssh_key_from_agent(username);
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let config = git2::Config::open_default()?;
            return Cred::credential_helper(&config, url, username);
        }
        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }
        Err(git2::Error::from_str("no supported credential type"))
    });
    callbacks
}

fn fetch_options<'a>(depth: Option<i32>) -> FetchOptions<'a> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks());
    if let Some(depth) = depth {
        options.depth(depth);
    }
    options
}

fn open(workdir: &Path) -> Result<Repository> {
    Repository::open(workdir).map_err(|err| local_failure("open working copy", &err))
}

fn origin(repo: &Repository) -> Result<Remote<'_>> {
    repo.find_remote(ORIGIN)
        .map_err(|err| local_failure("find origin remote", &err))
}

fn remote_url(remote: &Remote<'_>) -> String {
    remote.url().unwrap_or("origin").to_owned()
}

/// Branch that `branch` or, when absent, the checked-out HEAD refers to.
fn tracked_branch(repo: &Repository, branch: Option<&str>) -> Result<String> {
    if let Some(branch) = branch {
        return Ok(branch.to_owned());
    }
    let head = repo.head().map_err(|err| local_failure("read HEAD", &err))?;
    if !head.is_branch() {
        return Err(Error::validation(
            "branch",
            "working copy is detached and tracks no branch",
        ));
    }
    head.shorthand()
        .map(str::to_owned)
        .ok_or_else(|| Error::validation("branch", "branch name is not valid UTF-8"))
}

fn fetch_branch(repo: &Repository, branch: &str, depth: Option<i32>) -> Result<()> {
    let mut remote = origin(repo)?;
    let url = remote_url(&remote);
    let refspec = format!("+refs/heads/{branch}:refs/remotes/{ORIGIN}/{branch}");
    let mut options = fetch_options(depth);
    remote
        .fetch(&[refspec.as_str()], Some(&mut options), None)
        .map_err(|err| remote_failure(&url, Some(branch), &err))?;
    Ok(())
}

fn reset_to_remote(repo: &Repository, branch: &str) -> Result<()> {
    let refname = format!("refs/remotes/{ORIGIN}/{branch}");
    let target = repo
        .find_reference(&refname)
        .and_then(|reference| reference.peel_to_commit())
        .map_err(|err| match err.code() {
            git2::ErrorCode::NotFound => Error::RefNotFound {
                reference: branch.to_owned(),
            },
            _ => local_failure("resolve fetched branch", &err),
        })?;
    repo.reset(target.as_object(), ResetType::Hard, None)
        .map_err(|err| local_failure("reset working copy", &err))?;
    debug!(branch, oid = %target.id(), "working copy reset to remote tip");
    Ok(())
}

fn checkout_commit(repo: &Repository, url: &str, sha: &str, depth: Option<i32>) -> Result<()> {
    let commit = if let Ok(object) = repo.revparse_single(sha) {
        object.peel_to_commit()
    } else {
        // A shallow clone rarely contains an arbitrary commit; ask for it
        // directly, then fall back to the full history of every branch.
        let mut remote = origin(repo)?;
        let mut options = fetch_options(depth);
        if remote.fetch(&[sha], Some(&mut options), None).is_err() {
            let mut options = fetch_options(Some(UNSHALLOW_DEPTH));
            remote
                .fetch(
                    &[format!("+refs/heads/*:refs/remotes/{ORIGIN}/*").as_str()],
                    Some(&mut options),
                    None,
                )
                .map_err(|err| remote_failure(url, Some(sha), &err))?;
        }
        repo.revparse_single(sha)
            .and_then(|object| object.peel_to_commit())
    }
    .map_err(|_| Error::RefNotFound {
        reference: sha.to_owned(),
    })?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_tree(commit.as_object(), Some(&mut checkout))
        .map_err(|err| local_failure("checkout commit", &err))?;
    repo.set_head_detached(commit.id())
        .map_err(|err| local_failure("detach HEAD", &err))?;
    Ok(())
}

fn depth_arg(depth: Option<u32>) -> Option<i32> {
    depth.map(|depth| i32::try_from(depth).unwrap_or(UNSHALLOW_DEPTH))
}

impl GitBackend for Git2Backend {
    fn clone_repo(&self, url: &str, target: &Path, spec: &CloneSpec) -> Result<()> {
        let depth = depth_arg(spec.depth);
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options(depth));
        if let Some(branch) = &spec.branch {
            builder.branch(branch);
        }
        let repo = builder
            .clone(url, target)
            .map_err(|err| remote_failure(url, spec.branch.as_deref(), &err))?;
        if let Some(sha) = &spec.commit {
            checkout_commit(&repo, url, sha, depth)?;
        }
        info!(
            url = %corral_core::redact::redact_url(url),
            branch = spec.branch.as_deref().unwrap_or("<default>"),
            commit = spec.commit.as_deref().unwrap_or("-"),
            depth = ?spec.depth,
            "cloned repository"
        );
        Ok(())
    }

    fn fetch(&self, workdir: &Path, branch: Option<&str>) -> Result<()> {
        let repo = open(workdir)?;
        let branch = tracked_branch(&repo, branch)?;
        fetch_branch(&repo, &branch, None)?;
        reset_to_remote(&repo, &branch)?;
        info!(branch = %branch, "fetched working copy");
        Ok(())
    }

    fn unshallow(&self, workdir: &Path, branch: Option<&str>) -> Result<()> {
        let repo = open(workdir)?;
        let branch = tracked_branch(&repo, branch)?;
        if repo.is_shallow() {
            fetch_branch(&repo, &branch, Some(UNSHALLOW_DEPTH))?;
            info!(branch = %branch, "unshallowed working copy");
        } else {
            debug!(branch = %branch, "working copy already has full history; fetching");
            fetch_branch(&repo, &branch, None)?;
        }
        reset_to_remote(&repo, &branch)
    }

    fn push(&self, workdir: &Path, branch: Option<&str>) -> Result<()> {
        let repo = open(workdir)?;
        let branch = tracked_branch(&repo, branch)?;
        let mut remote = origin(&repo)?;
        let url = remote_url(&remote);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

        let mut rejection = None;
        {
            let mut callbacks = remote_callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(status) = status {
                    rejection = Some(format!("{refname}: {status}"));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|err| remote_failure(&url, None, &err))?;
        }
        if let Some(reason) = rejection {
            return Err(Error::remote(&url, format!("push rejected: {reason}")));
        }
        info!(branch = %branch, "pushed working copy");
        Ok(())
    }
}
