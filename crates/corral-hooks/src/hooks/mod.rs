//! Built-in hooks

mod commit;
mod lock;
mod migration;
mod sync;

pub use commit::CommitTransaction;
pub use lock::LockHook;
pub use migration::{METADATA_FILE, MigrationGate, MigrationStep, Migrations, SchemaMigrations};
pub use sync::SyncHook;
