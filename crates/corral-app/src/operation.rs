//! Named operations dispatched through the pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use corral_core::{Error, Result};
use corral_hooks::{PipelineContext, RunOptions};
use serde_json::Value;

/// A business operation that runs inside the pipeline.
pub trait Operation: Send + Sync {
    /// Stable identifier used for dispatch.
    fn id(&self) -> &'static str;

    /// Pipeline settings (lock mode, commit policy, ...) for this operation.
    fn options(&self) -> RunOptions;

    /// Run against the working copy bound in `ctx`.
    ///
    /// # Errors
    /// Operation specific; returned unchanged to the caller.
    fn run(&self, ctx: &mut PipelineContext<'_>, params: Value) -> Result<Value>;
}

type Handler = dyn Fn(&mut PipelineContext<'_>, Value) -> Result<Value> + Send + Sync;

/// [`Operation`] built from a closure.
pub struct FnOperation {
    id: &'static str,
    options: RunOptions,
    handler: Box<Handler>,
}

impl FnOperation {
    /// Operation `id` running `handler` with `options`.
    pub fn new<F>(id: &'static str, options: RunOptions, handler: F) -> Self
    where
        F: Fn(&mut PipelineContext<'_>, Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            id,
            options,
            handler: Box::new(handler),
        }
    }
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Operation for FnOperation {
    fn id(&self) -> &'static str {
        self.id
    }

    fn options(&self) -> RunOptions {
        self.options.clone()
    }

    fn run(&self, ctx: &mut PipelineContext<'_>, params: Value) -> Result<Value> {
        (self.handler)(ctx, params)
    }
}

/// Operations by id, filled in at startup.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<&'static str, Arc<dyn Operation>>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.operations.keys()).finish()
    }
}

impl OperationRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `operation`.
    ///
    /// # Errors
    /// [`Error::Validation`] when the id is empty or already registered.
    pub fn register(&mut self, operation: impl Operation + 'static) -> Result<()> {
        let id = operation.id();
        if id.trim().is_empty() {
            return Err(Error::validation("operation", "operation id must not be empty"));
        }
        if self.operations.contains_key(id) {
            return Err(Error::validation(
                "operation",
                format!("operation '{id}' is already registered"),
            ));
        }
        self.operations.insert(id, Arc::new(operation));
        Ok(())
    }

    /// Operation registered as `id`.
    ///
    /// # Errors
    /// [`Error::UnknownOperation`] when nothing is registered under `id`.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownOperation(id.to_owned()))
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&'static str> {
        self.operations.keys().copied().collect()
    }
}
