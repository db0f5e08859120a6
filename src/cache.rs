//! The in-memory response cache keyed by path and `Vary`-relevant headers.
//!
//! Entries are evicted FIFO by a cursor walking a fixed-size slot array
//! rather than by any recency policy: this bounds memory deterministically
//! at `CAPACITY` entries and makes eviction O(1) at insert time. A stale
//! entry (older than `TTL`) is skipped on lookup but not proactively
//! reclaimed — it is simply overwritten whenever the cursor next lands on
//! its slot.

use crate::http::request::Request;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const CAPACITY: usize = 10_000;
pub const TTL: Duration = Duration::from_secs(3600);

/// Files at or above this size are never cached, bounding per-entry memory.
pub const MAX_CACHEABLE_SIZE: u64 = 1024 * 1024;

/// One cached response: the wire bytes up to (but not including) the
/// per-connection `Connection:` header, plus the body, stored separately so
/// a HEAD hit can reuse `head` without the body.
pub struct CachedEntry {
    pub(crate) head: Vec<u8>,
    pub(crate) body: Vec<u8>,
    path: String,
    vary: String,
    inserted_at: Instant,
}

impl CachedEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < TTL
    }
}

struct Slot {
    entry: Option<Arc<CachedEntry>>,
}

struct Inner {
    slots: Vec<Slot>,
    index: FxHashMap<(String, String), usize>,
    cursor: usize,
}

/// A bounded, FIFO-evicted cache keyed by `(absolute_path, vary_key)`.
///
/// Cheap to clone: internally an `Arc<Mutex<_>>`, so a `Cache` handle can be
/// threaded through request handling without a process-wide singleton.
#[derive(Clone)]
pub struct Cache(Arc<Mutex<Inner>>);

impl Cache {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(CAPACITY);
        slots.resize_with(CAPACITY, || Slot { entry: None });
        Cache(Arc::new(Mutex::new(Inner {
            slots,
            index: FxHashMap::default(),
            cursor: 0,
        })))
    }

    pub fn lookup(&self, path: &str, vary: &str) -> Option<Arc<CachedEntry>> {
        let inner = self.0.lock().unwrap();
        let idx = *inner.index.get(&(path.to_string(), vary.to_string()))?;
        let entry = inner.slots[idx].entry.as_ref()?;
        if entry.is_fresh(Instant::now()) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Inserts `head`/`body` under `(path, vary)`, evicting whatever
    /// currently occupies the FIFO cursor's slot (dropping its bytes and
    /// removing its index mapping) before writing the new entry there.
    pub fn insert(&self, path: &str, vary: &str, head: Vec<u8>, body: Vec<u8>) {
        let mut inner = self.0.lock().unwrap();
        let idx = inner.cursor;
        inner.cursor = (inner.cursor + 1) % CAPACITY;

        if let Some(old) = inner.slots[idx].entry.take() {
            inner.index.remove(&(old.path.clone(), old.vary.clone()));
        }

        let entry = Arc::new(CachedEntry {
            head,
            body,
            path: path.to_string(),
            vary: vary.to_string(),
            inserted_at: Instant::now(),
        });
        inner.slots[idx].entry = Some(entry);
        inner.index.insert((path.to_string(), vary.to_string()), idx);
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// `"UA:<User-Agent>:AE:<Accept-Encoding>"`, substituting an empty string
/// for either header when absent. Two requests share a cache entry only if
/// both components match exactly, matching the announced `Vary` contract.
pub fn vary_key(req: &Request<'_>) -> String {
    let ua = req.header(b"User-Agent").map(|v| String::from_utf8_lossy(v)).unwrap_or_default();
    let ae = req.header(b"Accept-Encoding").map(|v| String::from_utf8_lossy(v)).unwrap_or_default();
    format!("UA:{}:AE:{}", ua, ae)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_hits() {
        let cache = Cache::new();
        cache.insert("/index.html", "UA::AE:", b"HEAD".to_vec(), b"BODY".to_vec());
        let entry = cache.lookup("/index.html", "UA::AE:").unwrap();
        assert_eq!(&entry.body, b"BODY");
    }

    #[test]
    fn different_vary_key_misses() {
        let cache = Cache::new();
        cache.insert("/index.html", "UA:a:AE:", b"H".to_vec(), b"B".to_vec());
        assert!(cache.lookup("/index.html", "UA:b:AE:").is_none());
    }

    #[test]
    fn fifo_eviction_overwrites_oldest_slot() {
        let cache = Cache::new();
        for i in 0..CAPACITY + 1 {
            cache.insert(&format!("/f{i}"), "", b"H".to_vec(), b"B".to_vec());
        }
        assert!(cache.lookup("/f0", "").is_none());
        assert!(cache.lookup(&format!("/f{CAPACITY}"), "").is_some());
    }

    #[test]
    fn stale_entry_is_ignored() {
        let cache = Cache::new();
        cache.insert("/x", "", b"H".to_vec(), b"B".to_vec());
        {
            let mut inner = cache.0.lock().unwrap();
            let idx = inner.index[&("/x".to_string(), "".to_string())];
            let entry = inner.slots[idx].entry.as_mut().unwrap();
            let stale = Arc::new(CachedEntry {
                head: entry.head.clone(),
                body: entry.body.clone(),
                path: entry.path.clone(),
                vary: entry.vary.clone(),
                inserted_at: Instant::now() - TTL - Duration::from_secs(1),
            });
            *entry = stale;
        }
        assert!(cache.lookup("/x", "").is_none());
    }
}
