use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_core::{CacheEntry, CacheKey, Error, ProjectId, Result};
use corral_lock::{LockMode, RepositoryLock, RepositoryLockGuard};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::EntryStore;

const STORE_LOCK: &str = ".store.lock";
const KEY_INDEX: &str = "keys";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Store keeping one pretty-printed `<project_id>.json` file per entry.
///
/// A `keys/<key digest>` file per entry maps its key to the project id, so
/// lookups by key read two files instead of the whole directory. Writers
/// serialise on a store-wide lock file, so several processes may share one
/// directory. Readers rely on atomic renames and take no lock.
#[derive(Clone, Debug)]
pub struct FileEntryStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileEntryStore {
    /// Open (creating if needed) the store rooted at `dir`.
    ///
    /// # Errors
    /// [`Error::Store`] when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| store_error("create store directory", &dir, &err))?;
        Ok(Self {
            dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Override how long writers wait for the store lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: ProjectId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_lock(&self) -> Result<RepositoryLockGuard> {
        Ok(RepositoryLock::acquire(
            &self.dir.join(STORE_LOCK),
            LockMode::Write,
            self.lock_timeout,
        )?)
    }

    fn read_record(path: &Path) -> Result<Option<CacheEntry>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(store_error("read entry", path, &err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| store_error("decode entry", path, &err))
    }

    fn index_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(KEY_INDEX).join(key.digest())
    }

    /// Project id the key index holds for `key`. A missing or garbled index
    /// file reads as absent.
    fn indexed_id(&self, key: &CacheKey) -> Result<Option<ProjectId>> {
        let path = self.index_path(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.parse().ok()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(store_error("read key index", &path, &err)),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let Some(id) = self.indexed_id(key)? else {
            return Ok(None);
        };
        match Self::read_record(&self.record_path(id))? {
            Some(entry) if &entry.key == key => Ok(Some(entry)),
            Some(_) => {
                // Digest collision: fall back to a full scan.
                Ok(self.scan()?.into_iter().find(|entry| &entry.key == key))
            }
            None => Ok(None),
        }
    }

    /// Index first, then the record: a crash in between leaves an index entry
    /// pointing at nothing, which reads as absent.
    fn write_record(&self, entry: &CacheEntry) -> Result<()> {
        let index = self.index_path(&entry.key);
        write_atomic(&index, entry.project_id.to_string().as_bytes())
            .map_err(|err| store_error("write key index", &index, &err))?;

        let path = self.record_path(entry.project_id);
        let body = serde_json::to_vec_pretty(entry)
            .map_err(|err| store_error("encode entry", &path, &err))?;
        write_atomic(&path, &body).map_err(|err| store_error("write entry", &path, &err))?;
        debug!(project_id = %entry.project_id, "cache entry written");
        Ok(())
    }

    fn remove_index(&self, entry: &CacheEntry) -> Result<()> {
        if self.indexed_id(&entry.key)? != Some(entry.project_id) {
            return Ok(());
        }
        let path = self.index_path(&entry.key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(store_error("delete key index", &path, &err)),
        }
    }

    fn scan(&self) -> Result<Vec<CacheEntry>> {
        let dir = fs::read_dir(&self.dir)
            .map_err(|err| store_error("list store directory", &self.dir, &err))?;
        let mut entries = Vec::new();
        for item in dir {
            let item = item.map_err(|err| store_error("list store directory", &self.dir, &err))?;
            let path = item.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !item.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match Self::read_record(&path) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable cache entry"),
            }
        }
        entries.sort_by_key(|entry| entry.project_id);
        Ok(entries)
    }
}

/// Write `body` to a hidden sibling temp file, then rename it over `path`.
fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let name = path.file_name().map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    let write = || -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

fn store_error(action: &str, path: &Path, err: &dyn std::fmt::Display) -> Error {
    warn!(path = %path.display(), error = %err, "{action} failed");
    Error::store(format!("failed to {action}: {err}"))
}

impl EntryStore for FileEntryStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.lookup(key)
    }

    fn get_by_id(&self, id: ProjectId) -> Result<Option<CacheEntry>> {
        Self::read_record(&self.record_path(id))
    }

    fn put(&self, entry: &CacheEntry) -> Result<()> {
        let _lock = self.write_lock()?;
        self.write_record(entry)
    }

    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<Option<CacheEntry>> {
        let _lock = self.write_lock()?;
        if let Some(existing) = self.lookup(&entry.key)? {
            return Ok(Some(existing));
        }
        self.write_record(entry)?;
        Ok(None)
    }

    fn delete(&self, id: ProjectId) -> Result<bool> {
        let _lock = self.write_lock()?;
        let path = self.record_path(id);
        let existing = Self::read_record(&path).ok().flatten();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(store_error("delete entry", &path, &err)),
        }
        if let Some(entry) = existing {
            self.remove_index(&entry)?;
        }
        debug!(project_id = %id, "cache entry deleted");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<CacheEntry>> {
        self.scan()
    }

    fn touch(&self, id: ProjectId, accessed_at: OffsetDateTime) -> Result<Option<CacheEntry>> {
        let _lock = self.write_lock()?;
        let Some(mut entry) = Self::read_record(&self.record_path(id))? else {
            return Ok(None);
        };
        entry.accessed_at = accessed_at;
        self.write_record(&entry)?;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn entry(branch: &str) -> Result<CacheEntry> {
        let key = CacheKey::for_branch("u1", "https://h/o/r", Some(branch))?;
        Ok(CacheEntry::pending(key, Some(1), datetime!(2024-05-01 12:00 UTC)))
    }

    #[test]
    fn records_survive_reopen() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let main = entry("main")?;
        FileEntryStore::open(dir.path())?.put(&main)?;

        let reopened = FileEntryStore::open(dir.path())?;
        assert_eq!(reopened.get_by_id(main.project_id)?, Some(main.clone()));
        assert_eq!(reopened.get(&main.key)?, Some(main));
        Ok(())
    }

    #[test]
    fn unreadable_records_are_skipped() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = FileEntryStore::open(dir.path())?;
        store.put(&entry("main")?)?;
        fs::write(dir.path().join("garbage.json"), b"{not json")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;
        assert_eq!(store.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupt_record_read_by_id_is_a_store_error() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = FileEntryStore::open(dir.path())?;
        let id = ProjectId::new();
        fs::write(dir.path().join(format!("{id}.json")), b"{")?;
        let err = store.get_by_id(id);
        assert!(matches!(err, Err(Error::Store(_))));
        Ok(())
    }

    #[test]
    fn insert_if_absent_and_delete() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = FileEntryStore::open(dir.path())?;
        let first = entry("main")?;
        assert!(store.insert_if_absent(&first)?.is_none());
        let loser = entry("main")?;
        assert_eq!(
            store.insert_if_absent(&loser)?.map(|e| e.project_id),
            Some(first.project_id)
        );
        assert!(store.get_by_id(loser.project_id)?.is_none());
        assert!(store.delete(first.project_id)?);
        assert!(!store.delete(first.project_id)?);
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn lookup_by_key_uses_the_index() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = FileEntryStore::open(dir.path())?;
        let main = entry("main")?;
        let dev = entry("dev")?;
        store.put(&main)?;
        store.put(&dev)?;

        let index = dir.path().join(KEY_INDEX).join(main.key.digest());
        assert_eq!(fs::read_to_string(&index)?, main.project_id.to_string());
        // Records the index does not point at are not consulted.
        fs::write(dir.path().join("unrelated.json"), b"{not json")?;
        assert_eq!(store.get(&main.key)?, Some(main.clone()));

        assert!(store.delete(main.project_id)?);
        assert!(!index.exists());
        assert_eq!(store.get(&main.key)?, None);
        assert_eq!(store.get(&dev.key)?, Some(dev));
        Ok(())
    }

    #[test]
    fn dangling_index_reads_as_absent() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = FileEntryStore::open(dir.path())?;
        let main = entry("main")?;
        fs::write(dir.path().join(KEY_INDEX).join(main.key.digest()), ProjectId::new().to_string())?;
        assert_eq!(store.get(&main.key)?, None);
        assert!(store.insert_if_absent(&main)?.is_none());
        assert_eq!(store.get(&main.key)?, Some(main));
        Ok(())
    }

    #[test]
    fn touch_persists_access_time() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = FileEntryStore::open(dir.path())?;
        let main = entry("main")?;
        store.put(&main)?;
        let later = datetime!(2024-05-01 12:45 UTC);
        store.touch(main.project_id, later)?;
        let reloaded = store.get_by_id(main.project_id)?;
        assert_eq!(reloaded.map(|e| e.accessed_at), Some(later));
        Ok(())
    }
}
