//! Local git remotes for tests.

use std::fs;
use std::path::{Path, PathBuf};

use git2::{Oid, PushOptions, Repository, RepositoryInitOptions, Signature};

/// Branch every fixture repository starts on.
pub const DEFAULT_BRANCH: &str = "main";

/// A bare repository served over `file://` plus a seeding clone used to
/// simulate upstream commits.
#[derive(Debug, Clone)]
pub struct RemoteFixture {
    /// Bare repository path.
    pub bare: PathBuf,
    /// Non-bare repository that pushes to [`Self::bare`].
    pub seed: PathBuf,
    /// `file://` URL of the bare repository.
    pub url: String,
}

fn io_error(err: &std::io::Error) -> git2::Error {
    git2::Error::from_str(&err.to_string())
}

/// Initialise a non-bare repository whose HEAD starts on [`DEFAULT_BRANCH`].
///
/// # Errors
/// Propagates git failures.
pub fn init_repo(path: &Path) -> Result<Repository, git2::Error> {
    let mut options = RepositoryInitOptions::new();
    options.initial_head(DEFAULT_BRANCH);
    Repository::init_opts(path, &options)
}

/// Write `contents` to `rel` inside the repository and commit it on HEAD.
///
/// # Errors
/// Propagates git and filesystem failures.
pub fn commit_file(repo: &Repository, rel: &str, contents: &str, message: &str) -> Result<Oid, git2::Error> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| git2::Error::from_str("bare repository has no working directory"))?;
    let path = workdir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| io_error(&err))?;
    }
    fs::write(&path, contents).map_err(|err| io_error(&err))?;

    let mut index = repo.index()?;
    index.add_path(Path::new(rel))?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let signature = Signature::now("fixture", "fixture@example.invalid")?;
    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(_) => None,
    };
    let parents: Vec<_> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
}

impl RemoteFixture {
    /// Create `<root>/remotes/<owner>/<name>` seeded with one commit on
    /// [`DEFAULT_BRANCH`].
    ///
    /// # Errors
    /// Propagates git and filesystem failures.
    pub fn create(root: &Path, owner: &str, name: &str) -> Result<Self, git2::Error> {
        let bare = root.join("remotes").join(owner).join(name);
        let seed = root.join("seeds").join(owner).join(name);
        fs::create_dir_all(&bare).map_err(|err| io_error(&err))?;
        let mut options = RepositoryInitOptions::new();
        options.bare(true).initial_head(DEFAULT_BRANCH);
        Repository::init_opts(&bare, &options)?;

        let url = format!("file://{}", bare.display());
        let repo = init_repo(&seed)?;
        repo.remote("origin", &url)?;
        let fixture = Self { bare, seed, url };
        commit_file(&repo, "README.md", "# fixture\n", "initial commit")?;
        fixture.push_seed(&repo)?;
        Ok(fixture)
    }

    /// Commit a file in the seed and push it, as another client would.
    ///
    /// # Errors
    /// Propagates git and filesystem failures.
    pub fn push_upstream(&self, rel: &str, contents: &str) -> Result<Oid, git2::Error> {
        let repo = Repository::open(&self.seed)?;
        let oid = commit_file(&repo, rel, contents, &format!("update {rel}"))?;
        self.push_seed(&repo)?;
        Ok(oid)
    }

    /// Create `branch` in the remote at the seed's HEAD.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn create_branch(&self, branch: &str) -> Result<(), git2::Error> {
        let repo = Repository::open(&self.seed)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &head, true)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut PushOptions::new()))
    }

    /// Tip of `branch` in the bare repository.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn remote_tip(&self, branch: &str) -> Result<Oid, git2::Error> {
        let repo = Repository::open_bare(&self.bare)?;
        let reference = repo.find_reference(&format!("refs/heads/{branch}"))?;
        reference
            .target()
            .ok_or_else(|| git2::Error::from_str("symbolic branch reference"))
    }

    fn push_seed(&self, repo: &Repository) -> Result<(), git2::Error> {
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("+refs/heads/{DEFAULT_BRANCH}:refs/heads/{DEFAULT_BRANCH}");
        remote.push(&[refspec.as_str()], Some(&mut PushOptions::new()))
    }
}
