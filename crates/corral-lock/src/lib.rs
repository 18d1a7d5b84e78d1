//! File-backed locking for cached working copies: a shared/exclusive lock per
//! working copy and a bounded set of concurrency slots.

/// Lock errors.
pub mod error;
/// Shared and exclusive working-copy locks.
pub mod lock;
/// Concurrency slots.
pub mod slots;

pub use error::LockError;
pub use lock::{LockMode, RepositoryLock, RepositoryLockGuard};
pub use slots::{ConcurrencySlots, SlotGuard};
