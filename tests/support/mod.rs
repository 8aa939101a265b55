#![allow(dead_code)]
#![allow(unused_imports)]

mod logging;
mod stores;
mod upstream;
mod wire;

pub use logging::*;
pub use stores::*;
pub use upstream::*;
pub use wire::*;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{Method, Request};
use outcache::policy::BasePolicy;
use outcache::store::CacheStore;
use outcache::{
    Clock, ManualClock, MemoryStore, OutputCache, OutputCacheBuilder, OutputCacheSettings,
};

/// A fixed, boring point in time for manual clocks.
pub fn epoch() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

pub fn memory_store(clock: Arc<dyn Clock>) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(
        NonZeroUsize::new(64).unwrap(),
        64 * 1024 * 1024,
        clock,
    ))
}

/// Cache with the default base policy, ready for most scenarios.
pub fn build_cache(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> OutputCache {
    cache_builder(store, clock).build().unwrap()
}

pub fn cache_builder(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> OutputCacheBuilder {
    OutputCache::builder(store)
        .clock(clock)
        .base_policy(Arc::new(BasePolicy))
}

pub fn small_body_settings(max_body_size: u64) -> OutputCacheSettings {
    let mut settings = OutputCacheSettings::default();
    settings.max_body_size = max_body_size;
    settings
}

pub fn get_request(uri: &str) -> Request<()> {
    Request::builder().uri(uri).body(()).unwrap()
}

pub fn request_with_headers(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<()> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap()
}
