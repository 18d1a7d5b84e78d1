//! Transactional hook pipeline wrapped around operations on cached working copies.
//!
//! A [`Pipeline`] runs each [`Hook`]'s pre-work in order, the operation body,
//! then post-work in reverse. Cleanup registered on the context's exit stack
//! runs on every exit path, panics included.

mod config;
mod executor;
mod hook;
/// Built-in hooks.
pub mod hooks;
mod types;

pub use config::PipelineConfig;
pub use executor::{Pipeline, PipelineBuilder, panic_error, panic_message};
pub use hook::Hook;
pub use hooks::{CommitTransaction, LockHook, MigrationGate, Migrations, SchemaMigrations, SyncHook};
pub use types::{
    CleanBefore, CommitPolicy, CommittedOid, ExitStack, MigrationChecked, PipelineContext, RunOptions, Stage,
};
