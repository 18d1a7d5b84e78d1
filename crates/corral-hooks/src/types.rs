//! Pipeline context and run options

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use corral_core::{Error, Result, WorkingCopy};
use corral_git::Worktree;
use corral_lock::LockMode;
use tracing::{debug, trace};

use crate::executor::Pipeline;

/// Steps of one pipeline invocation.
///
/// A successful write run walks `Init → MigrationCheck → Locked → Running →
/// Committing → Done`; any step may jump to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Context created, nothing acquired.
    Init,
    /// Schema version being checked (and migrated if requested).
    MigrationCheck,
    /// Working-copy lock held.
    Locked,
    /// Operation body running.
    Running,
    /// Commit transaction writing.
    Committing,
    /// Finished successfully.
    Done,
    /// Aborted; all exit handlers ran.
    Failed,
}

impl Stage {
    /// Lowercase label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::MigrationCheck => "migration-check",
            Self::Locked => "locked",
            Self::Running => "running",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the commit transaction writes a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Never commit.
    Never,
    /// Commit when the operation changed something.
    #[default]
    IfChanged,
    /// Always commit, even an empty one.
    Always,
    /// Commit, and fail with [`Error::NothingToCommit`] when nothing changed.
    RequireChanges,
}

/// Per-call pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Operation name used in logs, errors and default commit messages.
    pub operation: String,
    /// Lock taken on the working copy.
    pub lock: LockMode,
    /// Abort with [`Error::RepositoryNotClean`] if the working copy is dirty up front.
    pub requires_clean: bool,
    /// Restrict the commit to these paths.
    pub commit_paths: Option<Vec<String>>,
    /// Commit message; `corral: <operation>` when absent.
    pub commit_message: Option<String>,
    /// Commit behaviour.
    pub commit: CommitPolicy,
    /// Check the project metadata schema before running.
    pub requires_migration_check: bool,
    /// Migrate an outdated schema instead of failing.
    pub migrate_if_required: bool,
    /// Push after a successful commit.
    pub push: bool,
    /// Override of the configured lock timeout.
    pub lock_timeout: Option<Duration>,
}

impl RunOptions {
    /// Shared-lock run that never commits.
    #[must_use]
    pub fn read(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            lock: LockMode::Read,
            requires_clean: false,
            commit_paths: None,
            commit_message: None,
            commit: CommitPolicy::Never,
            requires_migration_check: false,
            migrate_if_required: false,
            push: false,
            lock_timeout: None,
        }
    }

    /// Exclusive-lock run that commits whatever the body changed.
    #[must_use]
    pub fn write(operation: impl Into<String>) -> Self {
        Self {
            lock: LockMode::Write,
            commit: CommitPolicy::IfChanged,
            ..Self::read(operation)
        }
    }

    /// Require a clean working copy before the body runs.
    #[must_use]
    pub const fn requiring_clean(mut self) -> Self {
        self.requires_clean = true;
        self
    }

    /// Restrict the commit to `paths`.
    #[must_use]
    pub fn with_commit_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commit_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Use `message` for the commit.
    #[must_use]
    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    /// Set the commit policy.
    #[must_use]
    pub const fn with_commit(mut self, policy: CommitPolicy) -> Self {
        self.commit = policy;
        self
    }

    /// Check the schema version first; migrate when `migrate` is set.
    #[must_use]
    pub const fn with_migration_check(mut self, migrate: bool) -> Self {
        self.requires_migration_check = true;
        self.migrate_if_required = migrate;
        self
    }

    /// Push after committing.
    #[must_use]
    pub const fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Wait at most `timeout` for the lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Message for the commit transaction.
    #[must_use]
    pub fn effective_commit_message(&self) -> String {
        self.commit_message
            .clone()
            .unwrap_or_else(|| format!("corral: {}", self.operation))
    }

    /// Reject combinations the pipeline cannot honour.
    ///
    /// # Errors
    /// [`Error::Validation`] when the operation name is empty or a shared-lock
    /// run asks for a commit or a push.
    pub fn validate(&self) -> Result<()> {
        if self.operation.trim().is_empty() {
            return Err(Error::validation("operation", "operation name must not be empty"));
        }
        if self.lock == LockMode::Read && (self.commit != CommitPolicy::Never || self.push) {
            return Err(Error::validation(
                "commit",
                "read-locked runs cannot commit or push",
            ));
        }
        Ok(())
    }
}

type ExitHandler = Box<dyn FnOnce() + Send>;

/// Handlers run in reverse registration order when the run ends.
///
/// Handlers left over when the stack is dropped (for instance while a panic
/// unwinds through the pipeline) run from `Drop`.
#[derive(Default)]
pub struct ExitStack {
    handlers: Vec<(&'static str, ExitHandler)>,
}

impl fmt::Debug for ExitStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(label, _)| label))
            .finish()
    }
}

impl ExitStack {
    /// Register `handler`.
    pub fn push(&mut self, label: &'static str, handler: impl FnOnce() + Send + 'static) {
        trace!(label, "exit handler registered");
        self.handlers.push((label, Box::new(handler)));
    }

    /// Run every pending handler, newest first. Each runs exactly once.
    pub fn unwind(&mut self) {
        while let Some((label, handler)) = self.handlers.pop() {
            debug!(label, "running exit handler");
            handler();
        }
    }

    /// Number of pending handlers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is pending.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Drop for ExitStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Marker stored by the migration gate once the schema is known to be current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationChecked {
    /// Schema version after any migration.
    pub version: u32,
}

/// Working copy cleanliness observed before the body ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanBefore {
    /// Paths that were already dirty.
    pub dirty_paths: Vec<String>,
}

impl CleanBefore {
    /// True when nothing was dirty.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.dirty_paths.is_empty()
    }
}

/// Commit written by the commit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedOid(pub corral_git::Oid);

/// Per-invocation state shared by the hooks and the operation body.
pub struct PipelineContext<'a> {
    pipeline: &'a Pipeline,
    working_copy: &'a WorkingCopy,
    options: RunOptions,
    stage: Stage,
    trail: Vec<Stage>,
    state: HashMap<TypeId, Box<dyn Any + Send>>,
    exits: ExitStack,
}

impl fmt::Debug for PipelineContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("working_copy", &self.working_copy)
            .field("operation", &self.options.operation)
            .field("stage", &self.stage)
            .field("exits", &self.exits)
            .finish_non_exhaustive()
    }
}

impl<'a> PipelineContext<'a> {
    pub(crate) fn new(pipeline: &'a Pipeline, working_copy: &'a WorkingCopy, options: RunOptions) -> Self {
        Self {
            pipeline,
            working_copy,
            options,
            stage: Stage::Init,
            trail: vec![Stage::Init],
            state: HashMap::new(),
            exits: ExitStack::default(),
        }
    }

    /// Pipeline running this context.
    #[must_use]
    pub const fn pipeline(&self) -> &'a Pipeline {
        self.pipeline
    }

    /// Working copy being operated on.
    #[must_use]
    pub const fn working_copy(&self) -> &'a WorkingCopy {
        self.working_copy
    }

    /// Options for this run.
    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order.
    #[must_use]
    pub fn trail(&self) -> &[Stage] {
        &self.trail
    }

    /// Move to `stage`; repeated transitions to the current stage are ignored.
    pub fn advance(&mut self, stage: Stage) {
        if self.stage == stage {
            return;
        }
        trace!(from = %self.stage, to = %stage, "pipeline stage");
        self.stage = stage;
        self.trail.push(stage);
    }

    /// Open the working copy for git operations.
    ///
    /// # Errors
    /// [`Error::Internal`] when the directory is not a git working copy.
    pub fn worktree(&self) -> Result<Worktree> {
        Worktree::open(&self.working_copy.path)
    }

    /// Hook state of type `T`, if recorded.
    #[must_use]
    pub fn state<T: Any + Send>(&self) -> Option<&T> {
        self.state
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Record hook state, replacing any previous value of the same type.
    pub fn insert_state<T: Any + Send>(&mut self, value: T) {
        self.state.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Register a handler to run when the invocation ends, whatever the outcome.
    pub fn push_exit(&mut self, label: &'static str, handler: impl FnOnce() + Send + 'static) {
        self.exits.push(label, handler);
    }

    /// Number of exit handlers still pending.
    #[must_use]
    pub const fn pending_exits(&self) -> usize {
        self.exits.len()
    }

    pub(crate) fn unwind(&mut self) {
        self.exits.unwind();
    }

    pub(crate) fn into_trail(mut self) -> Vec<Stage> {
        self.exits.unwind();
        std::mem::take(&mut self.trail)
    }
}
