//! Application layer for corral.
//!
//! This crate wires the repository cache, the hook pipeline and the operation
//! registry into one explicitly constructed service shared by the CLI and any
//! embedding server.

pub mod async_invoker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod invoker;
pub mod jobs;
pub mod operation;

// Re-exports for convenience
pub use async_invoker::AsyncInvoker;
pub use cache::{EvictionReport, RepositoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CorralConfig;
pub use invoker::{Invoker, ProjectRef};
pub use jobs::{InMemoryJobs, JobRegistry, NoJobs};
pub use operation::{FnOperation, Operation, OperationRegistry};
