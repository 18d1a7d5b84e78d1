use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use corral_core::{CacheEntry, CacheKey, ProjectId, Result};
use time::OffsetDateTime;

use crate::EntryStore;

/// Process-local store, used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: Mutex<HashMap<ProjectId, CacheEntry>>,
}

impl MemoryEntryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<ProjectId, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EntryStore for MemoryEntryStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.guard().values().find(|entry| &entry.key == key).cloned())
    }

    fn get_by_id(&self, id: ProjectId) -> Result<Option<CacheEntry>> {
        Ok(self.guard().get(&id).cloned())
    }

    fn put(&self, entry: &CacheEntry) -> Result<()> {
        self.guard().insert(entry.project_id, entry.clone());
        Ok(())
    }

    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<Option<CacheEntry>> {
        let mut entries = self.guard();
        if let Some(existing) = entries.values().find(|existing| existing.key == entry.key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(entry.project_id, entry.clone());
        drop(entries);
        Ok(None)
    }

    fn delete(&self, id: ProjectId) -> Result<bool> {
        Ok(self.guard().remove(&id).is_some())
    }

    fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries: Vec<_> = self.guard().values().cloned().collect();
        entries.sort_by_key(|entry| entry.project_id);
        Ok(entries)
    }

    fn touch(&self, id: ProjectId, accessed_at: OffsetDateTime) -> Result<Option<CacheEntry>> {
        Ok(self.guard().get_mut(&id).map(|entry| {
            entry.accessed_at = accessed_at;
            entry.clone()
        }))
    }
}
