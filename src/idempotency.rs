//! Command dedup cache: `request_id -> cached response`, TTL 10 minutes,
//! bounded LRU. Guarded entirely by the Command Processor — no other
//! component touches it.

use crate::command::Response;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 10_000;
const TTL: Duration = Duration::from_secs(10 * 60);

struct CacheEntry {
    response: Response,
    inserted_at: Instant,
}

/// LRU+TTL cache of recently-seen request ids. `Mutex`-guarded rather than
/// `RwLock`-guarded: every access mutates the LRU's recency order, so
/// there is no read/write split worth making.
pub struct IdempotencyCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    /// Returns the cached response for `request_id` if present and not yet
    /// expired. An expired entry is evicted on lookup.
    pub fn get(&self, request_id: &str) -> Option<Response> {
        let mut cache = self.inner.lock().expect("idempotency cache lock poisoned");
        match cache.get(request_id) {
            Some(entry) if entry.inserted_at.elapsed() < TTL => Some(entry.response.clone()),
            Some(_) => {
                cache.pop(request_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, request_id: String, response: Response) {
        let mut cache = self.inner.lock().expect("idempotency cache lock poisoned");
        cache.put(request_id, CacheEntry { response, inserted_at: Instant::now() });
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}
