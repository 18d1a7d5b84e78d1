//! Invocation layer: resolves a project reference and runs work on it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use corral_core::{CacheEntry, CacheKey, ProjectId, Result};
use corral_git::GitBackend;
use corral_hooks::{Pipeline, PipelineContext, RunOptions, panic_error};
use corral_store::EntryStore;
use serde_json::Value;
use tracing::{debug, info_span, warn};

use crate::cache::RepositoryCache;
use crate::operation::OperationRegistry;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// How a request names its project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectRef {
    /// A project already in the cache.
    ById(ProjectId),
    /// A remote repository at a branch or commit, cloned on demand.
    Remote {
        /// Tenant owning the working copy.
        owner: String,
        /// Remote URL.
        url: String,
        /// Branch to track; the remote default when both this and `commit` are unset.
        branch: Option<String>,
        /// Commit to pin.
        commit: Option<String>,
        /// Accept a shallow clone.
        shallow: bool,
    },
}

impl ProjectRef {
    /// Shallow reference to the default branch of `url`.
    pub fn remote(owner: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Remote {
            owner: owner.into(),
            url: url.into(),
            branch: None,
            commit: None,
            shallow: true,
        }
    }

    /// Track `branch` instead of the default branch.
    #[must_use]
    pub fn with_branch(mut self, value: impl Into<String>) -> Self {
        if let Self::Remote { branch, .. } = &mut self {
            *branch = Some(value.into());
        }
        self
    }

    /// Pin `sha`.
    #[must_use]
    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        if let Self::Remote { commit, .. } = &mut self {
            *commit = Some(sha.into());
        }
        self
    }

    /// Require full history.
    #[must_use]
    pub fn full_history(mut self) -> Self {
        if let Self::Remote { shallow, .. } = &mut self {
            *shallow = false;
        }
        self
    }
}

/// Entry point tying the cache, the pipeline and the operation registry together.
pub struct Invoker<S, G> {
    cache: Arc<RepositoryCache<S, G>>,
    pipeline: Pipeline,
    registry: Arc<OperationRegistry>,
}

impl<S, G> std::fmt::Debug for Invoker<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("cache", &self.cache)
            .field("pipeline", &self.pipeline)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<S: EntryStore, G: GitBackend> Invoker<S, G> {
    /// Invoker over explicitly constructed collaborators.
    #[must_use]
    pub const fn new(
        cache: Arc<RepositoryCache<S, G>>,
        pipeline: Pipeline,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            cache,
            pipeline,
            registry,
        }
    }

    /// Underlying cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<RepositoryCache<S, G>> {
        &self.cache
    }

    /// Pipeline every operation runs through.
    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Registered operations.
    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Ready cache entry for `project`.
    ///
    /// # Errors
    /// [`Error::ProjectNotFound`] for unknown ids, [`Error::Validation`] for a
    /// malformed remote reference, otherwise as [`RepositoryCache::get`].
    pub fn resolve(&self, project: &ProjectRef) -> Result<CacheEntry> {
        match project {
            ProjectRef::ById(project_id) => self.cache.get_by_id(*project_id),
            ProjectRef::Remote {
                owner,
                url,
                branch,
                commit,
                shallow,
            } => {
                let key = CacheKey::new(owner, url, branch.as_deref(), commit.as_deref())?;
                self.cache.get(&key, *shallow)
            }
        }
    }

    /// Resolve `project` and run `body` on it inside the pipeline.
    ///
    /// A panic in `body` is reported as [`Error::Internal`] after the pipeline
    /// released everything it held.
    ///
    /// # Errors
    /// Resolution errors, hook errors, or the body's own error unchanged.
    pub fn execute<T, F>(&self, project: &ProjectRef, options: RunOptions, body: F) -> Result<T>
    where
        F: FnOnce(&mut PipelineContext<'_>) -> Result<T>,
    {
        let entry = self.resolve(project)?;
        let working_copy = self.cache.handle(&entry);
        let operation = options.operation.clone();
        let span = info_span!("invoke", operation = %operation, project_id = %entry.project_id);
        let _entered = span.enter();

        catch_unwind(AssertUnwindSafe(|| self.pipeline.run(&working_copy, options, body)))
            .unwrap_or_else(|payload| Err(panic_error(&operation, Some(entry.project_id), &*payload)))
    }

    /// Run the registered operation `operation_id` on `project`.
    ///
    /// # Errors
    /// [`Error::UnknownOperation`] for unregistered ids, otherwise as
    /// [`Self::execute`].
    pub fn dispatch(&self, project: &ProjectRef, operation_id: &str, params: Value) -> Result<Value> {
        let operation = self.registry.get(operation_id)?;
        self.execute(project, operation.options(), |ctx| operation.run(ctx, params))
    }

    /// [`Self::execute`], retried up to `attempts` times while the error is retryable.
    ///
    /// Each attempt resolves the project again, so a purged cache entry is
    /// re-cloned.
    ///
    /// # Errors
    /// The last error, or the first non-retryable one.
    pub fn execute_with_retry<T, F>(
        &self,
        project: &ProjectRef,
        options: &RunOptions,
        attempts: u32,
        mut body: F,
    ) -> Result<T>
    where
        F: FnMut(&mut PipelineContext<'_>) -> Result<T>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.execute(project, options.clone(), &mut body) {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(attempt, attempts, error = %err, "retryable failure; retrying");
                    thread::sleep(RETRY_BASE_DELAY * attempt);
                    attempt += 1;
                }
                result => {
                    debug!(attempt, ok = result.is_ok(), "execution finished");
                    return result;
                }
            }
        }
    }

    /// [`Self::dispatch`] with the retry policy of [`Self::execute_with_retry`].
    ///
    /// # Errors
    /// As [`Self::execute_with_retry`].
    pub fn dispatch_with_retry(
        &self,
        project: &ProjectRef,
        operation_id: &str,
        params: &Value,
        attempts: u32,
    ) -> Result<Value> {
        let operation = self.registry.get(operation_id)?;
        self.execute_with_retry(project, &operation.options(), attempts, |ctx| {
            operation.run(ctx, params.clone())
        })
    }
}

