//! Git access for cached working copies: remote operations behind the
//! [`GitBackend`] trait and local commit/status operations on [`Worktree`].

/// Remote operations.
pub mod backend;
mod error;
/// Local git fixtures for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;
/// Local working-copy operations.
pub mod worktree;

pub use backend::{CloneSpec, Git2Backend, GitBackend};
pub use git2::{Oid, Signature};
pub use worktree::{CommitRequest, Worktree, signature};
