//! Pipeline execution logic

use std::fmt;
use std::sync::Arc;

use corral_core::{Error, Result, WorkingCopy};
use corral_git::GitBackend;
use tracing::{debug, info_span, warn};

use crate::config::PipelineConfig;
use crate::hook::Hook;
use crate::hooks::{CommitTransaction, LockHook, MigrationGate, Migrations, SyncHook};
use crate::types::{PipelineContext, RunOptions, Stage};

/// Ordered chain of hooks wrapped around every operation body.
#[derive(Clone, Default)]
pub struct Pipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("hooks", &self.hook_names())
            .finish()
    }
}

/// Builder composing a [`Pipeline`] hook by hook.
#[derive(Default)]
pub struct PipelineBuilder {
    hooks: Vec<Arc<dyn Hook>>,
}

impl PipelineBuilder {
    /// Append `hook`; its pre-work runs after every hook added before it.
    #[must_use]
    pub fn hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Append an already shared hook.
    #[must_use]
    pub fn shared_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Finish the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline { hooks: self.hooks }
    }
}

impl Pipeline {
    /// Start an empty builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The built-in chain: migration gate, lock, push, commit.
    ///
    /// Post-work runs in reverse, so a run commits, then pushes, then releases
    /// its lock. Hooks named in `config.disabled` are left out.
    #[must_use]
    pub fn standard(
        config: &PipelineConfig,
        migrations: Arc<dyn Migrations>,
        git: Arc<dyn GitBackend>,
    ) -> Self {
        let candidates: [Arc<dyn Hook>; 4] = [
            Arc::new(MigrationGate::new(migrations)),
            Arc::new(LockHook::new(config.lock_timeout())),
            Arc::new(SyncHook::new(git)),
            Arc::new(CommitTransaction::new(
                config.commit_author_name.clone(),
                config.commit_author_email.clone(),
            )),
        ];
        let mut builder = Self::builder();
        for hook in candidates {
            if config.is_hook_enabled(hook.name()) {
                builder = builder.shared_hook(hook);
            } else {
                debug!(hook = hook.name(), "hook disabled by configuration");
            }
        }
        builder.build()
    }

    /// Hook names in pre-work order.
    #[must_use]
    pub fn hook_names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|hook| hook.name()).collect()
    }

    /// Run `body` on `working_copy` inside the hook chain.
    ///
    /// # Errors
    /// The first error from a hook or from `body`, unchanged. Every exit
    /// handler has run by the time this returns.
    pub fn run<T, F>(&self, working_copy: &WorkingCopy, options: RunOptions, body: F) -> Result<T>
    where
        F: FnOnce(&mut PipelineContext<'_>) -> Result<T>,
    {
        self.run_with_trail(working_copy, options, body).0
    }

    /// Like [`Pipeline::run`], also returning the stages the run went through.
    pub fn run_with_trail<T, F>(
        &self,
        working_copy: &WorkingCopy,
        options: RunOptions,
        body: F,
    ) -> (Result<T>, Vec<Stage>)
    where
        F: FnOnce(&mut PipelineContext<'_>) -> Result<T>,
    {
        let span = info_span!(
            "pipeline",
            operation = %options.operation,
            project_id = %working_copy.project_id,
        );
        let _entered = span.enter();

        if let Err(err) = options.validate() {
            return (Err(err), vec![Stage::Init, Stage::Failed]);
        }

        let mut ctx = PipelineContext::new(self, working_copy, options);
        let result = self.drive(&mut ctx, body);
        match &result {
            Ok(_) => {
                ctx.unwind();
                ctx.advance(Stage::Done);
            }
            Err(err) => {
                ctx.unwind();
                ctx.advance(Stage::Failed);
                if err.kind() == corral_core::ErrorKind::Internal {
                    warn!(error = %err, "pipeline failed");
                } else {
                    debug!(error = %err, kind = %err.kind(), "pipeline aborted");
                }
            }
        }
        let trail = ctx.into_trail();
        debug!(trail = ?trail, "pipeline finished");
        (result, trail)
    }

    fn drive<T, F>(&self, ctx: &mut PipelineContext<'_>, body: F) -> Result<T>
    where
        F: FnOnce(&mut PipelineContext<'_>) -> Result<T>,
    {
        for hook in &self.hooks {
            debug!(hook = hook.name(), stage = %hook.stage(), "pre-work");
            hook.before(ctx)?;
        }

        ctx.advance(Stage::Running);
        let value = body(ctx)?;

        for hook in self.hooks.iter().rev() {
            debug!(hook = hook.name(), stage = %hook.stage(), "post-work");
            hook.after(ctx)?;
        }
        Ok(value)
    }
}

/// Turn a panic payload from an operation body into an internal error.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "operation panicked".to_owned())
}

/// Wrap a caught panic from `operation` as [`Error::Internal`].
#[must_use]
pub fn panic_error(
    operation: &str,
    project_id: Option<corral_core::ProjectId>,
    payload: &(dyn std::any::Any + Send),
) -> Error {
    let message = panic_message(payload);
    let error = Error::internal(operation, project_id, format!("panicked: {message}"));
    if let Some(correlation_id) = error.correlation_id() {
        warn!(%correlation_id, operation, panic = %message, "operation panicked");
    }
    error
}
