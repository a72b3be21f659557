// Memory tier: cache entries and the lock-guarded LRU that holds them.

use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use super::lru::{LruCache, MemoryCost};

/// How complete a cached payload is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// The whole resource.
    Downloaded,
    /// A prefix of an interrupted transfer, with the validator (ETag or
    /// Last-Modified) to send as `If-Range` when resuming.
    Resumable(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub data: Bytes,
    pub kind: EntryKind,
}

impl CacheEntry {
    pub fn downloaded(data: Bytes) -> Self {
        Self {
            data,
            kind: EntryKind::Downloaded,
        }
    }

    pub fn resumable(data: Bytes, validator: Option<String>) -> Self {
        Self {
            data,
            kind: EntryKind::Resumable(validator),
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self.kind, EntryKind::Resumable(_))
    }
}

impl MemoryCost for CacheEntry {
    fn memory_cost(&self) -> usize {
        self.data.len()
    }
}

/// Thread-safe wrapper around the LRU. Lookups hand out clones so the lock is
/// never held past the call.
pub struct MemoryCache {
    inner: Mutex<LruCache<Url, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity_bytes)),
        }
    }

    pub fn get(&self, url: &Url) -> Option<CacheEntry> {
        self.inner.lock().get(url).cloned()
    }

    /// The resumable prefix for `url`, if that is what the memory tier holds.
    pub fn resumable(&self, url: &Url) -> Option<(Bytes, Option<String>)> {
        let mut cache = self.inner.lock();
        match cache.get(url) {
            Some(CacheEntry {
                data,
                kind: EntryKind::Resumable(validator),
            }) => Some((data.clone(), validator.clone())),
            _ => None,
        }
    }

    /// Drop the entry for `url` only if it is a resumable prefix.
    pub fn discard_resumable(&self, url: &Url) {
        let mut cache = self.inner.lock();
        if cache.peek(url).map(CacheEntry::is_resumable).unwrap_or(false) {
            cache.remove(url);
        }
    }

    pub fn put(&self, url: Url, entry: Option<CacheEntry>) {
        self.inner.lock().put(url, entry);
    }

    pub fn remove(&self, url: &Url) -> Option<CacheEntry> {
        self.inner.lock().remove(url)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Bytes currently held.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().total_cost()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.lock().capacity()
    }
}
