//! Domain types shared by every corral crate: cache identities, cache entries and
//! the classified error taxonomy.

/// Cache entry records and working-copy handles.
pub mod entry;
/// Classified errors.
pub mod error;
/// Identifier types.
pub mod id;
/// Cache keys and remote URL normalisation.
pub mod key;
/// Scrubbing of credentials and filesystem paths from user-facing text.
pub mod redact;

pub use entry::{CacheEntry, WorkingCopy};
pub use error::{Error, ErrorKind, Result};
pub use id::ProjectId;
pub use key::CacheKey;
