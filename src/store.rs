use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::clock::Clock;

/// Backing storage for serialized cache entries.
///
/// Values are opaque blobs; tags attach at set time and exist for group
/// eviction. Implementations may evict at will and must be safe to share
/// across requests. Cancellation is structural: callers drop the future.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, tags: &[String], ttl: Duration) -> Result<()>;

    async fn evict_by_tag(&self, tag: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    tags: Vec<String>,
    expires_at: SystemTime,
}

#[derive(Debug)]
struct MemoryStoreState {
    lru: LruCache<String, StoredBlob>,
    bytes_in_use: u64,
    // tag -> keys carrying it; kept in lockstep with the LRU
    tagged: HashMap<String, HashSet<String>>,
}

/// In-memory blob store: LRU-bounded entry count plus a byte budget, with
/// per-entry expiry read from the injected clock.
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
    clock: Arc<dyn Clock>,
    max_bytes: u64,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize, max_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryStoreState {
                lru: LruCache::new(capacity),
                bytes_in_use: 0,
                tagged: HashMap::new(),
            }),
            clock,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemoryStoreState {
    fn forget(&mut self, key: &str, blob: &StoredBlob) {
        self.bytes_in_use = self.bytes_in_use.saturating_sub(blob.data.len() as u64);
        for tag in &blob.tags {
            if let Some(keys) = self.tagged.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tagged.remove(tag);
                }
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired = match state.lru.get(key) {
            Some(blob) => blob.expires_at <= now,
            None => return Ok(None),
        };
        if expired {
            if let Some(blob) = state.lru.pop(key) {
                state.forget(key, &blob);
            }
            return Ok(None);
        }
        Ok(state.lru.get(key).map(|blob| blob.data.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, tags: &[String], ttl: Duration) -> Result<()> {
        let blob = StoredBlob {
            expires_at: self.clock.now() + ttl,
            data: value,
            tags: tags.to_vec(),
        };
        let mut state = self.state.lock();

        if let Some(previous) = state.lru.pop(key) {
            state.forget(key, &previous);
        }
        state.bytes_in_use = state.bytes_in_use.saturating_add(blob.data.len() as u64);
        for tag in tags {
            state
                .tagged
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        if let Some((evicted_key, evicted)) = state.lru.push(key.to_string(), blob) {
            // push only returns an evicted pair for a *different* key
            state.forget(&evicted_key, &evicted);
        }

        while state.bytes_in_use > self.max_bytes {
            match state.lru.pop_lru() {
                Some((evicted_key, evicted)) => {
                    trace!(key = %evicted_key, "evicting under byte pressure");
                    state.forget(&evicted_key, &evicted);
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn evict_by_tag(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        let keys = match state.tagged.remove(tag) {
            Some(keys) => keys,
            None => return Ok(()),
        };
        for key in keys {
            if let Some(blob) = state.lru.pop(&key) {
                state.forget(&key, &blob);
            }
        }
        Ok(())
    }
}
