//! Hook trait

use corral_core::Result;

use crate::types::{PipelineContext, Stage};

/// A unit of pre-work and post-work composed around an operation body.
///
/// `before` runs in registration order; `after` runs in reverse order and only
/// when the body and every later hook succeeded. Anything a hook must undo on
/// every exit path belongs on the context's exit stack, not in `after`.
pub trait Hook: Send + Sync {
    /// Stable name, used in logs and [`crate::Pipeline::hook_names`].
    fn name(&self) -> &'static str;

    /// Stage this hook works in.
    fn stage(&self) -> Stage;

    /// Pre-work.
    ///
    /// # Errors
    /// Any error aborts the run before the body executes.
    fn before(&self, _ctx: &mut PipelineContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Post-work on the success path.
    ///
    /// # Errors
    /// Any error fails the run; exit handlers still run.
    fn after(&self, _ctx: &mut PipelineContext<'_>) -> Result<()> {
        Ok(())
    }
}
