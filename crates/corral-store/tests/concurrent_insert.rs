#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use corral_core::{CacheEntry, CacheKey};
use corral_store::{EntryStore, FileEntryStore, MemoryEntryStore};
use time::macros::datetime;

fn race<S: EntryStore + 'static>(store: Arc<S>) {
    let key = CacheKey::for_branch("u1", "https://h/o/r", Some("main")).expect("key");
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let candidate = CacheEntry::pending(key, Some(1), datetime!(2024-05-01 12:00 UTC));
                barrier.wait();
                store
                    .insert_if_absent(&candidate)
                    .expect("insert")
                    .map_or(candidate.project_id, |winner| winner.project_id)
            })
        })
        .collect();

    let ids: HashSet<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();
    assert_eq!(ids.len(), 1, "every racer must see the same winner");
    assert_eq!(store.list().expect("list").len(), 1);
}

#[test]
fn memory_store_has_one_winner() {
    race(Arc::new(MemoryEntryStore::new()));
}

#[test]
fn file_store_has_one_winner() {
    let dir = tempfile::tempdir().expect("create temp dir");
    race(Arc::new(FileEntryStore::open(dir.path()).expect("open store")));
}
