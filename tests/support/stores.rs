use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use outcache::{CacheStore, Clock, MemoryStore};

/// Store wrapper with switchable failure injection on either operation.
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStore::new(NonZeroUsize::new(64).unwrap(), 64 * 1024 * 1024, clock),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected read failure");
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, tags: &[String], ttl: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected write failure");
        }
        self.inner.set(key, value, tags, ttl).await
    }

    async fn evict_by_tag(&self, tag: &str) -> Result<()> {
        self.inner.evict_by_tag(tag).await
    }
}
