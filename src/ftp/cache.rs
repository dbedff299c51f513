//! Directory-listing cache.
//!
//! Raw listing text keyed by everything that can change its content:
//! server identity, user, path syntax, path, the listing command used
//! and whether the channel was protected. Refreshes race: a commit is
//! accepted only when its fetch started strictly later than the fetch
//! that produced the cached text.

use crate::ftp::types::ServerPathType;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub path_type: ServerPathType,
    pub path: String,
    pub list_command: String,
    pub tls: bool,
}

#[derive(Debug, Clone)]
struct CachedListing {
    text: String,
    acquired: DateTime<Utc>,
    /// When the fetch that produced this text began.
    start_time: Instant,
}

type InvalidationObserver = Box<dyn Fn(&ListingKey) + Send + Sync>;

/// Shared cache of raw listing text. Lock is held only for map access,
/// never across I/O.
pub struct ListingCache {
    inner: Mutex<HashMap<ListingKey, CachedListing>>,
    observers: Mutex<Vec<InvalidationObserver>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Cached text and its acquisition date, or `None`; never blocks.
    pub fn get(&self, key: &ListingKey) -> Option<(String, DateTime<Utc>)> {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .map(|c| (c.text.clone(), c.acquired))
    }

    /// Commit a fetched listing. Returns whether it was accepted: a
    /// fetch that started no later than the cached one is discarded,
    /// so the recorded start-time never decreases.
    pub fn put(
        &self,
        key: ListingKey,
        text: String,
        start_time: Instant,
        acquired: DateTime<Utc>,
    ) -> bool {
        let mut map = self.inner.lock().unwrap();
        if let Some(existing) = map.get(&key) {
            if start_time <= existing.start_time {
                return false;
            }
        }
        map.insert(
            key,
            CachedListing {
                text,
                acquired,
                start_time,
            },
        );
        true
    }

    /// Drop one entry and broadcast the invalidation to other sessions
    /// viewing the same path.
    pub fn invalidate(&self, key: &ListingKey) {
        let removed = self.inner.lock().unwrap().remove(key).is_some();
        if removed {
            self.notify(key);
        }
    }

    /// Drop every entry for a path regardless of listing command, path
    /// syntax or channel protection.
    pub fn invalidate_path(&self, host: &str, port: u16, user: &str, path: &str) {
        let dropped: Vec<ListingKey> = {
            let mut map = self.inner.lock().unwrap();
            let keys: Vec<ListingKey> = map
                .keys()
                .filter(|k| k.host == host && k.port == port && k.user == user && k.path == path)
                .cloned()
                .collect();
            for k in &keys {
                map.remove(k);
            }
            keys
        };
        for k in &dropped {
            self.notify(k);
        }
    }

    pub fn on_invalidation(&self, f: InvalidationObserver) {
        self.observers.lock().unwrap().push(f);
    }

    fn notify(&self, key: &ListingKey) {
        for f in self.observers.lock().unwrap().iter() {
            f(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn key(path: &str) -> ListingKey {
        ListingKey {
            host: "ftp.example.com".into(),
            port: 21,
            user: "test".into(),
            path_type: ServerPathType::Unix,
            path: path.into(),
            list_command: "LIST".into(),
            tls: false,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = ListingCache::new();
        assert!(cache.get(&key("/a")).is_none());
        cache.put(key("/a"), "listing".into(), Instant::now(), Utc::now());
        let (text, _) = cache.get(&key("/a")).unwrap();
        assert_eq!(text, "listing");
    }

    #[test]
    fn stale_refresh_is_discarded() {
        let cache = ListingCache::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        assert!(cache.put(key("/a"), "newer".into(), t1, Utc::now()));
        // an older fetch finishing late must not clobber the newer text
        assert!(!cache.put(key("/a"), "older".into(), t0, Utc::now()));
        assert_eq!(cache.get(&key("/a")).unwrap().0, "newer");
        // equal start-time is also rejected: strictly newer only
        assert!(!cache.put(key("/a"), "same".into(), t1, Utc::now()));
    }

    #[test]
    fn start_time_non_decreasing_over_puts() {
        let cache = ListingCache::new();
        let t0 = Instant::now();
        let times = [3u64, 1, 4, 2, 5, 5, 0];
        let mut committed_max = None::<u64>;
        for s in times {
            let accepted = cache.put(
                key("/a"),
                format!("t{}", s),
                t0 + Duration::from_secs(s),
                Utc::now(),
            );
            let newer = committed_max.map(|m| s > m).unwrap_or(true);
            assert_eq!(accepted, newer);
            if accepted {
                committed_max = Some(s);
            }
        }
        assert_eq!(cache.get(&key("/a")).unwrap().0, "t5");
    }

    #[test]
    fn distinct_keys_do_not_collide() {
        let cache = ListingCache::new();
        let mut other = key("/a");
        other.list_command = "LIST -la".into();
        cache.put(key("/a"), "plain".into(), Instant::now(), Utc::now());
        cache.put(other.clone(), "detailed".into(), Instant::now(), Utc::now());
        assert_eq!(cache.get(&key("/a")).unwrap().0, "plain");
        assert_eq!(cache.get(&other).unwrap().0, "detailed");
    }

    #[test]
    fn invalidate_path_drops_variants_and_notifies() {
        let cache = ListingCache::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        cache.on_invalidation(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let mut detailed = key("/a");
        detailed.list_command = "LIST -la".into();
        cache.put(key("/a"), "x".into(), Instant::now(), Utc::now());
        cache.put(detailed, "y".into(), Instant::now(), Utc::now());
        cache.put(key("/b"), "z".into(), Instant::now(), Utc::now());
        cache.invalidate_path("ftp.example.com", 21, "test", "/a");
        assert_eq!(cache.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(cache.get(&key("/b")).is_some());
    }
}
