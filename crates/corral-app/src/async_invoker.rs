//! Async bridge for callers running on a tokio runtime.

use std::sync::Arc;

use corral_core::{CacheEntry, Error, Result};
use corral_git::GitBackend;
use corral_hooks::panic_error;
use corral_store::EntryStore;
use serde_json::Value;
use tokio::task::JoinError;

use crate::cache::EvictionReport;
use crate::invoker::{Invoker, ProjectRef};

/// Runs [`Invoker`] calls on tokio's blocking pool.
///
/// Locks, git and the entry store all block, so every call moves to
/// `spawn_blocking` and the async caller only awaits the result.
pub struct AsyncInvoker<S, G> {
    inner: Arc<Invoker<S, G>>,
}

impl<S, G> Clone for AsyncInvoker<S, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, G> std::fmt::Debug for AsyncInvoker<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInvoker").field("inner", &self.inner).finish()
    }
}

fn join_error(operation: &str, err: JoinError) -> Error {
    if err.is_panic() {
        let payload = err.into_panic();
        return panic_error(operation, None, &*payload);
    }
    Error::internal(operation, None, format!("task join error: {err}"))
}

impl<S, G> AsyncInvoker<S, G>
where
    S: EntryStore + 'static,
    G: GitBackend + 'static,
{
    /// Wrap a shared invoker.
    #[must_use]
    pub const fn new(inner: Arc<Invoker<S, G>>) -> Self {
        Self { inner }
    }

    /// Blocking invoker behind this bridge.
    #[must_use]
    pub const fn inner(&self) -> &Arc<Invoker<S, G>> {
        &self.inner
    }

    /// Async [`Invoker::resolve`].
    ///
    /// # Errors
    /// As [`Invoker::resolve`]; a failed blocking task becomes [`Error::Internal`].
    pub async fn resolve(&self, project: ProjectRef) -> Result<CacheEntry> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.resolve(&project))
            .await
            .map_err(|err| join_error("resolve", err))?
    }

    /// Async [`Invoker::dispatch`].
    ///
    /// # Errors
    /// As [`Invoker::dispatch`]; a failed blocking task becomes [`Error::Internal`].
    pub async fn dispatch(&self, project: ProjectRef, operation_id: String, params: Value) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        let operation = operation_id.clone();
        tokio::task::spawn_blocking(move || inner.dispatch(&project, &operation_id, params))
            .await
            .map_err(|err| join_error(&operation, err))?
    }

    /// Async [`crate::RepositoryCache::evict_expired`].
    ///
    /// # Errors
    /// As [`crate::RepositoryCache::evict_expired`].
    pub async fn evict_expired(&self) -> Result<EvictionReport> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.cache().evict_expired())
            .await
            .map_err(|err| join_error("evict_expired", err))?
    }
}
