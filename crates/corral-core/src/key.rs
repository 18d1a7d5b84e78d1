use std::fmt::{self, Write as _};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::redact::redact_url;

/// Hex characters of the key digest appended to every slot name.
const DIGEST_LEN: usize = 16;

/// Identity of one cache slot.
///
/// The same remote at two different refs occupies two slots, so all four
/// fields take part in equality and in the on-disk location.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Tenant that owns the working copy.
    pub owner_id: String,
    /// Normalised remote URL (no trailing `/` or `.git`).
    pub remote_url: String,
    /// Tracked branch; `None` means the remote's default branch.
    pub branch: Option<String>,
    /// Pinned commit; mutually exclusive with `branch`.
    pub commit_sha: Option<String>,
}

impl CacheKey {
    /// Build and validate a key.
    ///
    /// Empty `branch`/`commit_sha` values count as absent.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] naming the offending field when the owner is
    /// empty, the URL has no `<owner>/<repo>` path, both a branch and a commit are
    /// given, or the commit is not a hex sha.
    pub fn new(
        owner_id: &str,
        remote_url: &str,
        branch: Option<&str>,
        commit_sha: Option<&str>,
    ) -> Result<Self> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(Error::validation("owner", "owner id must not be empty"));
        }

        let remote_url = normalize_remote_url(remote_url);
        if repo_path_segments(&remote_url).is_none() {
            return Err(Error::validation(
                "remote_url",
                format!("'{}' does not name a <owner>/<repository>", redact_url(&remote_url)),
            ));
        }

        let branch = branch.map(str::trim).filter(|b| !b.is_empty());
        let commit_sha = commit_sha.map(str::trim).filter(|c| !c.is_empty());
        if branch.is_some() && commit_sha.is_some() {
            return Err(Error::validation(
                "branch",
                "branch and commit_sha are mutually exclusive",
            ));
        }
        if let Some(branch) = branch {
            validate_branch(branch)?;
        }
        let commit_sha = commit_sha.map(validate_commit).transpose()?;

        Ok(Self {
            owner_id: owner_id.to_owned(),
            remote_url,
            branch: branch.map(str::to_owned),
            commit_sha,
        })
    }

    /// Key tracking a branch (or the default branch when `None`).
    ///
    /// # Errors
    /// See [`CacheKey::new`].
    pub fn for_branch(owner_id: &str, remote_url: &str, branch: Option<&str>) -> Result<Self> {
        Self::new(owner_id, remote_url, branch, None)
    }

    /// Key pinned to a commit.
    ///
    /// # Errors
    /// See [`CacheKey::new`].
    pub fn for_commit(owner_id: &str, remote_url: &str, commit_sha: &str) -> Result<Self> {
        Self::new(owner_id, remote_url, None, Some(commit_sha))
    }

    /// True when the key pins a commit; such entries never go stale.
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.commit_sha.is_some()
    }

    /// Owner segment of the remote repository path.
    #[must_use]
    pub fn repo_owner(&self) -> &str {
        repo_path_segments(&self.remote_url).map_or("", |(owner, _)| owner)
    }

    /// Repository name segment of the remote path.
    #[must_use]
    pub fn repo_slug(&self) -> &str {
        repo_path_segments(&self.remote_url).map_or("", |(_, slug)| slug)
    }

    /// Host (and port) of the remote; `local` for `file://` remotes.
    #[must_use]
    pub fn repo_host(&self) -> &str {
        url_host(&self.remote_url)
            .filter(|host| !host.is_empty())
            .unwrap_or("local")
    }

    /// Human-readable ref: branch name, `detached-head-<sha>` or `default`.
    #[must_use]
    pub fn ref_label(&self) -> String {
        match (&self.branch, &self.commit_sha) {
            (_, Some(sha)) => format!("detached-head-{sha}"),
            (Some(branch), None) => branch.clone(),
            (None, None) => "default".to_owned(),
        }
    }

    /// Directory holding every slot of this remote:
    /// `<owner>/<host>/<repo-owner>/<repo-slug>`, each component escaped.
    #[must_use]
    pub fn repo_dir(&self) -> PathBuf {
        [
            self.owner_id.as_str(),
            self.repo_host(),
            self.repo_owner(),
            self.repo_slug(),
        ]
        .into_iter()
        .map(escape_component)
        .collect()
    }

    /// Leaf name of the slot inside [`Self::repo_dir`].
    ///
    /// `branch-<name>`, `commit-<sha>` or `default`, followed by a digest of
    /// the whole key. Branch names are escaped, so two keys never share a leaf.
    #[must_use]
    pub fn slot_name(&self) -> String {
        let label = match (&self.branch, &self.commit_sha) {
            (_, Some(sha)) => format!("commit-{sha}"),
            (Some(branch), None) => format!("branch-{}", escape_component(branch)),
            (None, None) => "default".to_owned(),
        };
        format!("{label}-{}", self.digest())
    }

    /// Stable digest over all four fields.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let fields = [
            Some(self.owner_id.as_str()),
            Some(self.remote_url.as_str()),
            self.branch.as_deref(),
            self.commit_sha.as_deref(),
        ];
        for field in fields {
            match field {
                Some(value) => {
                    hasher.update([1]);
                    hasher.update(u64::try_from(value.len()).unwrap_or(u64::MAX).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_LEN);
        digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.owner_id,
            redact_url(&self.remote_url),
            self.ref_label()
        )
    }
}

/// Trim whitespace, trailing slashes and a trailing `.git`.
#[must_use]
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/');
    if let Some(stripped) = url.strip_suffix(".git") {
        url = stripped.trim_end_matches('/');
    }
    url.to_owned()
}

fn url_path(url: &str) -> Option<&str> {
    if let Some(idx) = url.find("://") {
        let scheme = &url[..idx];
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return None;
        }
        let after = &url[idx + 3..];
        let slash = after.find('/')?;
        return Some(&after[slash..]);
    }
    // scp-like syntax: git@host:owner/repo
    let (host, path) = url.split_once(':')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some(path)
}

fn url_host(url: &str) -> Option<&str> {
    let authority = if let Some(idx) = url.find("://") {
        url[idx + 3..].split('/').next()?
    } else {
        url.split_once(':')?.0
    };
    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

/// Percent-encode the characters that would change the meaning of a path
/// component. The mapping is reversible, so distinct inputs stay distinct.
fn escape_component(raw: &str) -> String {
    match raw {
        "" => return "%".to_owned(),
        "." => return "%2E".to_owned(),
        ".." => return "%2E%2E".to_owned(),
        _ => {}
    }
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '/' | '\\' | ':') || c.is_control() {
            let mut buf = [0; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(escaped, "%{byte:02X}");
            }
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn repo_path_segments(url: &str) -> Option<(&str, &str)> {
    let path = url_path(url)?;
    let mut segments = path.split('/').filter(|s| !s.is_empty()).rev();
    let slug = segments.next()?;
    let owner = segments.next()?;
    Some((owner, slug))
}

fn validate_branch(branch: &str) -> Result<()> {
    let invalid = branch.starts_with('-')
        || branch.contains("..")
        || branch.ends_with('/')
        || branch.chars().any(|c| c.is_whitespace() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'));
    if invalid {
        return Err(Error::validation(
            "branch",
            format!("'{branch}' is not a valid branch name"),
        ));
    }
    Ok(())
}

fn validate_commit(sha: &str) -> Result<String> {
    if (4..=40).contains(&sha.len()) && sha.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(sha.to_ascii_lowercase())
    } else {
        Err(Error::validation(
            "commit_sha",
            format!("'{sha}' is not a hexadecimal commit sha"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_git_and_slashes() -> Result<()> {
        let key = CacheKey::for_branch("u1", " https://h/o/r.git/ ", Some("main"))?;
        assert_eq!(key.remote_url, "https://h/o/r");
        assert_eq!(key.repo_owner(), "o");
        assert_eq!(key.repo_slug(), "r");
        Ok(())
    }

    #[test]
    fn same_remote_at_different_refs_are_distinct_slots() -> Result<()> {
        let main = CacheKey::for_branch("u1", "https://h/o/r", Some("main"))?;
        let dev = CacheKey::for_branch("u1", "https://h/o/r", Some("dev"))?;
        let same = CacheKey::for_branch("u1", "https://h/o/r.git", Some("main"))?;
        assert_ne!(main, dev);
        assert_eq!(main, same);
        Ok(())
    }

    #[test]
    fn branch_and_commit_are_mutually_exclusive() {
        let err = CacheKey::new("u1", "https://h/o/r", Some("main"), Some("abc123"));
        assert!(matches!(err, Err(Error::Validation { field: "branch", .. })));
    }

    #[test]
    fn empty_branch_and_commit_count_as_absent() -> Result<()> {
        let key = CacheKey::new("u1", "https://h/o/r", Some(""), Some(" "))?;
        assert_eq!(key.branch, None);
        assert_eq!(key.commit_sha, None);
        assert_eq!(key.ref_label(), "default");
        Ok(())
    }

    #[test]
    fn rejects_urls_without_owner_and_repo() {
        for url in ["https://h/", "https://h/r", "not a url", "://h/o/r"] {
            let err = CacheKey::for_branch("u1", url, None);
            assert!(
                matches!(err, Err(Error::Validation { field: "remote_url", .. })),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_scp_and_file_urls() -> Result<()> {
        let scp = CacheKey::for_branch("u1", "git@github.com:owner/repo.git", None)?;
        assert_eq!((scp.repo_owner(), scp.repo_slug()), ("owner", "repo"));
        let file = CacheKey::for_branch("u1", "file:///tmp/remotes/owner/repo", None)?;
        assert_eq!((file.repo_owner(), file.repo_slug()), ("owner", "repo"));
        Ok(())
    }

    #[test]
    fn validates_commit_sha() -> Result<()> {
        let key = CacheKey::for_commit("u1", "https://h/o/r", "ABCDEF1")?;
        assert_eq!(key.commit_sha.as_deref(), Some("abcdef1"));
        assert!(key.is_detached());
        assert_eq!(key.ref_label(), "detached-head-abcdef1");
        assert!(matches!(
            CacheKey::for_commit("u1", "https://h/o/r", "xyz"),
            Err(Error::Validation { field: "commit_sha", .. })
        ));
        Ok(())
    }

    #[test]
    fn rejects_empty_owner_and_bad_branch() {
        assert!(matches!(
            CacheKey::for_branch(" ", "https://h/o/r", None),
            Err(Error::Validation { field: "owner", .. })
        ));
        assert!(matches!(
            CacheKey::for_branch("u1", "https://h/o/r", Some("feature..x")),
            Err(Error::Validation { field: "branch", .. })
        ));
    }

    #[test]
    fn host_ignores_userinfo_and_keeps_port() -> Result<()> {
        let https = CacheKey::for_branch("u1", "https://user:pw@git.example:8443/o/r", None)?;
        assert_eq!(https.repo_host(), "git.example:8443");
        let scp = CacheKey::for_branch("u1", "git@github.com:o/r", None)?;
        assert_eq!(scp.repo_host(), "github.com");
        let file = CacheKey::for_branch("u1", "file:///srv/o/r", None)?;
        assert_eq!(file.repo_host(), "local");
        Ok(())
    }

    #[test]
    fn escaping_is_reversible_on_separators() {
        assert_eq!(escape_component("feature/login"), "feature%2Flogin");
        assert_eq!(escape_component("feature%2Flogin"), "feature%252Flogin");
        assert_eq!(escape_component("h:8080"), "h%3A8080");
        assert_eq!(escape_component(".."), "%2E%2E");
        assert_eq!(escape_component("..x"), "..x");
        assert_eq!(escape_component(""), "%");
    }

    #[test]
    fn slot_names_are_distinct_per_key() -> Result<()> {
        let keys = [
            CacheKey::for_branch("u1", "https://h/o/r", Some("feature/login"))?,
            CacheKey::for_branch("u1", "https://h/o/r", Some("feature-login"))?,
            CacheKey::for_branch("u1", "https://h/o/r", Some("default"))?,
            CacheKey::for_branch("u1", "https://h/o/r", None)?,
            CacheKey::for_branch("u1", "https://h/o/r", Some("detached-head-abc1234"))?,
            CacheKey::for_commit("u1", "https://h/o/r", "abc1234")?,
            CacheKey::for_branch("u1", "https://other/o/r", None)?,
            CacheKey::for_branch("u1", "https://h:8080/o/r", None)?,
        ];
        let locations: std::collections::HashSet<_> = keys
            .iter()
            .map(|key| key.repo_dir().join(key.slot_name()))
            .collect();
        assert_eq!(locations.len(), keys.len());
        Ok(())
    }

    #[test]
    fn slot_name_is_stable() -> Result<()> {
        let a = CacheKey::for_branch("u1", "https://h/o/r.git", Some("main"))?;
        let b = CacheKey::for_branch("u1", "https://h/o/r", Some("main"))?;
        assert_eq!(a.slot_name(), b.slot_name());
        assert!(a.slot_name().starts_with("branch-main-"));
        assert_eq!(a.digest().len(), DIGEST_LEN);
        Ok(())
    }

    #[test]
    fn display_hides_credentials() -> Result<()> {
        let key = CacheKey::for_branch("u1", "https://user:pw@h/o/r", Some("main"))?;
        let rendered = key.to_string();
        assert!(!rendered.contains("pw"));
        assert!(rendered.ends_with("@main"));
        Ok(())
    }
}
