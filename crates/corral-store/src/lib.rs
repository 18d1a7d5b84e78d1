//! Persistence of cache entry records.

use corral_core::{CacheEntry, CacheKey, ProjectId, Result};
use time::OffsetDateTime;

/// JSON-file backed store.
pub mod file;
/// In-memory store.
pub mod memory;

pub use file::FileEntryStore;
pub use memory::MemoryEntryStore;

/// Storage of [`CacheEntry`] records, shared by every cache user.
///
/// Implementations must be safe to call from many threads at once;
/// [`EntryStore::insert_if_absent`] is the only operation that has to be atomic
/// with respect to the key.
pub trait EntryStore: Send + Sync {
    /// Entry stored for `key`, if any.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Entry stored under `id`, if any.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn get_by_id(&self, id: ProjectId) -> Result<Option<CacheEntry>>;

    /// Insert or replace the record for `entry.project_id`.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn put(&self, entry: &CacheEntry) -> Result<()>;

    /// Store `entry` unless its key is already present.
    ///
    /// Returns `None` when `entry` was stored, or the existing record otherwise.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<Option<CacheEntry>>;

    /// Remove the record for `id`; returns false when there was none.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn delete(&self, id: ProjectId) -> Result<bool>;

    /// Every stored record.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn list(&self) -> Result<Vec<CacheEntry>>;

    /// Record a client access. Returns the updated entry, or `None` when `id` is gone.
    ///
    /// # Errors
    /// [`corral_core::Error::Store`] when the backing storage fails.
    fn touch(&self, id: ProjectId, accessed_at: OffsetDateTime) -> Result<Option<CacheEntry>> {
        let Some(mut entry) = self.get_by_id(id)? else {
            return Ok(None);
        };
        entry.accessed_at = accessed_at;
        self.put(&entry)?;
        Ok(Some(entry))
    }
}

impl<T: EntryStore + ?Sized> EntryStore for std::sync::Arc<T> {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        (**self).get(key)
    }

    fn get_by_id(&self, id: ProjectId) -> Result<Option<CacheEntry>> {
        (**self).get_by_id(id)
    }

    fn put(&self, entry: &CacheEntry) -> Result<()> {
        (**self).put(entry)
    }

    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<Option<CacheEntry>> {
        (**self).insert_if_absent(entry)
    }

    fn delete(&self, id: ProjectId) -> Result<bool> {
        (**self).delete(id)
    }

    fn list(&self) -> Result<Vec<CacheEntry>> {
        (**self).list()
    }

    fn touch(&self, id: ProjectId, accessed_at: OffsetDateTime) -> Result<Option<CacheEntry>> {
        (**self).touch(id, accessed_at)
    }
}
