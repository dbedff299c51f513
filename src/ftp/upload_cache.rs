//! Upload-side listing cache.
//!
//! Upload operations mutate remote directories while those same
//! directories may be getting refreshed. Each entry is a sorted
//! snapshot of {name, kind, size} plus a change log accumulated while a
//! refresh is outstanding: when the refresh lands, only changes dated
//! after the fetch's start are replayed onto the snapshot, in order, so
//! no mutation performed during the refresh is ever lost. A change that
//! cannot be applied demotes the entry to Unreliable instead of leaving
//! it silently stale.

use crate::ftp::cache::ListingKey;
use crate::ftp::types::{EntryKind, ListingEntry, ServerPathType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// One remote-directory mutation observed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    CreateDir,
    Delete,
    /// An upload started writing this file; size still unknown.
    StoreFile,
    /// An upload finished; the file now has this size.
    FileUploaded { size: u64 },
}

#[derive(Debug, Clone)]
pub struct Change {
    pub at: Instant,
    pub kind: ChangeKind,
    pub name: String,
}

/// Result of a cache lookup. Never blocks; `InProgress` carries a
/// notification the caller can await instead of fetching itself.
pub enum UploadCacheLookup {
    Hit(Vec<ListingEntry>, DateTime<Utc>),
    /// Caller fetches, then calls `finish` (or `abort_refresh`). The
    /// entry is now marked in-progress for everyone else.
    Miss,
    InProgress(oneshot::Receiver<()>),
}

enum EntryState {
    Ready {
        entries: Vec<ListingEntry>,
        acquired: DateTime<Utc>,
        start_time: Instant,
    },
    InProgress {
        change_log: Vec<Change>,
        waiters: Vec<oneshot::Sender<()>>,
        /// Start-time of the previous Ready snapshot, if any; guards
        /// the monotonic commit rule across the refresh.
        prior_start: Option<Instant>,
    },
    /// Replay failed; the entry must be re-fetched to be trusted again.
    Unreliable,
}

pub struct UploadListingCache {
    inner: Mutex<HashMap<ListingKey, EntryState>>,
}

impl UploadListingCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Look a directory up. A miss (including an Unreliable entry)
    /// flips the entry to InProgress with the caller as the fetcher.
    pub fn get(&self, key: &ListingKey) -> UploadCacheLookup {
        let mut map = self.inner.lock().unwrap();
        match map.get_mut(key) {
            Some(EntryState::Ready {
                entries, acquired, ..
            }) => UploadCacheLookup::Hit(entries.clone(), *acquired),
            Some(EntryState::InProgress { waiters, .. }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                UploadCacheLookup::InProgress(rx)
            }
            Some(EntryState::Unreliable) | None => {
                map.insert(
                    key.clone(),
                    EntryState::InProgress {
                        change_log: Vec::new(),
                        waiters: Vec::new(),
                        prior_start: None,
                    },
                );
                UploadCacheLookup::Miss
            }
        }
    }

    /// Commit a fetched snapshot. Replays logged changes dated after
    /// `start_time` in order before the entry becomes visible; a change
    /// that cannot be applied demotes the entry to Unreliable. Returns
    /// whether the snapshot was accepted.
    pub fn finish(
        &self,
        key: &ListingKey,
        mut entries: Vec<ListingEntry>,
        start_time: Instant,
        acquired: DateTime<Utc>,
    ) -> bool {
        let mut map = self.inner.lock().unwrap();
        let state = match map.remove(key) {
            Some(s) => s,
            None => return false,
        };
        match state {
            EntryState::InProgress {
                change_log,
                waiters,
                prior_start,
            } => {
                if prior_start.map(|p| start_time <= p).unwrap_or(false) {
                    // a stale fetch; keep nothing rather than old data
                    map.insert(key.clone(), EntryState::Unreliable);
                    notify(waiters);
                    return false;
                }
                entries.sort_by(|a, b| key.path_type.compare_names(&a.name, &b.name));
                let mut ok = true;
                for change in change_log {
                    if change.at <= start_time {
                        continue; // already reflected in the snapshot
                    }
                    if apply_change(&mut entries, &change, key.path_type).is_err() {
                        ok = false;
                        break;
                    }
                }
                if ok {
                    map.insert(
                        key.clone(),
                        EntryState::Ready {
                            entries,
                            acquired,
                            start_time,
                        },
                    );
                } else {
                    log::warn!("listing replay failed for {}, entry unreliable", key.path);
                    map.insert(key.clone(), EntryState::Unreliable);
                }
                notify(waiters);
                ok
            }
            other => {
                // finish without a matching get; keep what was there
                map.insert(key.clone(), other);
                false
            }
        }
    }

    /// Start re-fetching a Ready entry (expiry, user refresh). Later
    /// getters queue; the old snapshot's start-time still guards the
    /// monotonic commit rule.
    pub fn begin_refresh(&self, key: &ListingKey) {
        let mut map = self.inner.lock().unwrap();
        let prior_start = match map.get(key) {
            Some(EntryState::Ready { start_time, .. }) => Some(*start_time),
            Some(_) => return, // already refreshing, or unreliable
            None => None,
        };
        map.insert(
            key.clone(),
            EntryState::InProgress {
                change_log: Vec::new(),
                waiters: Vec::new(),
                prior_start,
            },
        );
    }

    /// The fetch failed; drop the in-progress marker and wake waiters.
    pub fn abort_refresh(&self, key: &ListingKey) {
        let mut map = self.inner.lock().unwrap();
        if let Some(EntryState::InProgress { waiters, .. }) = map.remove(key) {
            notify(waiters);
        }
    }

    /// Record one observed mutation: applied in place on a Ready entry,
    /// queued on an in-flight one, ignored for unknown directories.
    pub fn record_change(&self, key: &ListingKey, kind: ChangeKind, name: &str, at: Instant) {
        let mut map = self.inner.lock().unwrap();
        match map.get_mut(key) {
            Some(EntryState::Ready { entries, .. }) => {
                let change = Change {
                    at,
                    kind,
                    name: name.to_string(),
                };
                if apply_change(entries, &change, key.path_type).is_err() {
                    log::warn!(
                        "in-place listing update failed for {}, entry unreliable",
                        key.path
                    );
                    map.insert(key.clone(), EntryState::Unreliable);
                }
            }
            Some(EntryState::InProgress { change_log, .. }) => {
                change_log.push(Change {
                    at,
                    kind,
                    name: name.to_string(),
                });
            }
            Some(EntryState::Unreliable) | None => {}
        }
    }

    /// A mutation whose outcome is unknown poisons the whole entry.
    pub fn invalidate(&self, key: &ListingKey) {
        let mut map = self.inner.lock().unwrap();
        match map.remove(key) {
            Some(EntryState::InProgress { waiters, .. }) => {
                // the in-flight fetch result can no longer be trusted
                map.insert(key.clone(), EntryState::Unreliable);
                notify(waiters);
            }
            _ => {}
        }
    }
}

impl Default for UploadListingCache {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(waiters: Vec<oneshot::Sender<()>>) {
    for w in waiters {
        let _ = w.send(());
    }
}

/// Apply one change to a sorted entry set. Insertions dedup by name;
/// a kind conflict (directory vs existing file) is a replay failure.
fn apply_change(
    entries: &mut Vec<ListingEntry>,
    change: &Change,
    path_type: ServerPathType,
) -> Result<(), ()> {
    let pos = entries.binary_search_by(|e| path_type.compare_names(&e.name, &change.name));
    match &change.kind {
        ChangeKind::CreateDir => match pos {
            Ok(i) => {
                if entries[i].kind != EntryKind::Directory {
                    return Err(());
                }
                Ok(())
            }
            Err(i) => {
                entries.insert(
                    i,
                    ListingEntry {
                        name: change.name.clone(),
                        kind: EntryKind::Directory,
                        size: 0,
                    },
                );
                Ok(())
            }
        },
        ChangeKind::Delete => {
            if let Ok(i) = pos {
                entries.remove(i);
            }
            Ok(())
        }
        ChangeKind::StoreFile => match pos {
            Ok(i) => {
                if entries[i].kind == EntryKind::Directory {
                    return Err(());
                }
                Ok(())
            }
            Err(i) => {
                entries.insert(
                    i,
                    ListingEntry {
                        name: change.name.clone(),
                        kind: EntryKind::File,
                        size: 0,
                    },
                );
                Ok(())
            }
        },
        ChangeKind::FileUploaded { size } => match pos {
            Ok(i) => {
                if entries[i].kind == EntryKind::Directory {
                    return Err(());
                }
                entries[i].size = *size;
                Ok(())
            }
            Err(i) => {
                entries.insert(
                    i,
                    ListingEntry {
                        name: change.name.clone(),
                        kind: EntryKind::File,
                        size: *size,
                    },
                );
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> ListingKey {
        ListingKey {
            host: "ftp.example.com".into(),
            port: 21,
            user: "test".into(),
            path_type: ServerPathType::Unix,
            path: "/up".into(),
            list_command: "LIST".into(),
            tls: false,
        }
    }

    fn file(name: &str, size: u64) -> ListingEntry {
        ListingEntry {
            name: name.into(),
            kind: EntryKind::File,
            size,
        }
    }

    fn names(entries: &[ListingEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn miss_marks_in_progress() {
        let cache = UploadListingCache::new();
        assert!(matches!(cache.get(&key()), UploadCacheLookup::Miss));
        assert!(matches!(
            cache.get(&key()),
            UploadCacheLookup::InProgress(_)
        ));
    }

    #[test]
    fn finish_wakes_waiters_and_serves_hits() {
        let cache = UploadListingCache::new();
        assert!(matches!(cache.get(&key()), UploadCacheLookup::Miss));
        let rx = match cache.get(&key()) {
            UploadCacheLookup::InProgress(rx) => rx,
            _ => panic!("expected InProgress"),
        };
        let t = Instant::now();
        assert!(cache.finish(&key(), vec![file("a", 1)], t, Utc::now()));
        assert!(rx.blocking_recv().is_ok());
        match cache.get(&key()) {
            UploadCacheLookup::Hit(entries, _) => assert_eq!(names(&entries), ["a"]),
            _ => panic!("expected Hit"),
        }
    }

    #[test]
    fn changes_during_refresh_replayed_in_order() {
        let cache = UploadListingCache::new();
        let k = key();
        let t0 = Instant::now();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        // two uploads of the same file complete while the fetch runs
        cache.record_change(
            &k,
            ChangeKind::FileUploaded { size: 10 },
            "a.txt",
            t0 + Duration::from_millis(10),
        );
        cache.record_change(
            &k,
            ChangeKind::FileUploaded { size: 20 },
            "a.txt",
            t0 + Duration::from_millis(20),
        );
        assert!(cache.finish(&k, vec![], t0, Utc::now()));
        match cache.get(&k) {
            UploadCacheLookup::Hit(entries, _) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "a.txt");
                assert_eq!(entries[0].size, 20);
            }
            _ => panic!("expected Hit"),
        }
    }

    #[test]
    fn changes_older_than_snapshot_skipped() {
        let cache = UploadListingCache::new();
        let k = key();
        let t0 = Instant::now();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        cache.record_change(
            &k,
            ChangeKind::Delete,
            "a.txt",
            t0, // not newer than the snapshot's start
        );
        assert!(cache.finish(&k, vec![file("a.txt", 5)], t0, Utc::now()));
        match cache.get(&k) {
            UploadCacheLookup::Hit(entries, _) => assert_eq!(names(&entries), ["a.txt"]),
            _ => panic!("expected Hit"),
        }
    }

    #[test]
    fn replay_is_idempotent_by_name() {
        let mut entries = vec![file("a", 1), file("c", 3)];
        let change = Change {
            at: Instant::now(),
            kind: ChangeKind::FileUploaded { size: 2 },
            name: "b".into(),
        };
        apply_change(&mut entries, &change, ServerPathType::Unix).unwrap();
        let once = entries.clone();
        apply_change(&mut entries, &change, ServerPathType::Unix).unwrap();
        assert_eq!(entries, once);
        assert_eq!(names(&entries), ["a", "b", "c"]);
    }

    #[test]
    fn replay_conflict_demotes_to_unreliable() {
        let cache = UploadListingCache::new();
        let k = key();
        let t0 = Instant::now();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        cache.record_change(
            &k,
            ChangeKind::CreateDir,
            "a.txt",
            t0 + Duration::from_millis(5),
        );
        // snapshot has a.txt as a plain file: the change cannot apply
        assert!(!cache.finish(&k, vec![file("a.txt", 1)], t0, Utc::now()));
        // unreliable entries read as a miss and get re-fetched
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
    }

    #[test]
    fn ready_entry_updated_in_place_ordered() {
        let cache = UploadListingCache::new();
        let k = key();
        let t0 = Instant::now();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        assert!(cache.finish(&k, vec![file("b", 1)], t0, Utc::now()));
        cache.record_change(&k, ChangeKind::StoreFile, "a", Instant::now());
        cache.record_change(&k, ChangeKind::CreateDir, "d", Instant::now());
        cache.record_change(&k, ChangeKind::Delete, "b", Instant::now());
        match cache.get(&k) {
            UploadCacheLookup::Hit(entries, _) => {
                assert_eq!(names(&entries), ["a", "d"]);
                assert_eq!(entries[1].kind, EntryKind::Directory);
            }
            _ => panic!("expected Hit"),
        }
    }

    #[test]
    fn case_insensitive_dedup_on_windows_paths() {
        let mut k = key();
        k.path_type = ServerPathType::Windows;
        let cache = UploadListingCache::new();
        let t0 = Instant::now();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        assert!(cache.finish(&k, vec![file("A.TXT", 1)], t0, Utc::now()));
        cache.record_change(
            &k,
            ChangeKind::FileUploaded { size: 9 },
            "a.txt",
            Instant::now(),
        );
        match cache.get(&k) {
            UploadCacheLookup::Hit(entries, _) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].size, 9);
            }
            _ => panic!("expected Hit"),
        }
    }

    #[test]
    fn unknown_outcome_invalidates_in_flight_entry() {
        let cache = UploadListingCache::new();
        let k = key();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        cache.invalidate(&k);
        // the pending finish is rejected: its result cannot be trusted
        assert!(!cache.finish(&k, vec![file("x", 1)], Instant::now(), Utc::now()));
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
    }

    #[test]
    fn stale_refresh_never_replaces_newer_snapshot() {
        let cache = UploadListingCache::new();
        let k = key();
        let t0 = Instant::now();
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
        assert!(cache.finish(&k, vec![file("new", 1)], t0 + Duration::from_secs(2), Utc::now()));
        cache.begin_refresh(&k);
        // the refresh reports a start-time older than the snapshot's
        assert!(!cache.finish(&k, vec![file("old", 1)], t0, Utc::now()));
        // the entry is not trusted either way
        assert!(matches!(cache.get(&k), UploadCacheLookup::Miss));
    }
}
