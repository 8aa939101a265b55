use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{Extensions, HeaderMap, Method, Request, StatusCode, Uri};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::entry::CacheEntry;
use crate::key::VaryRules;

#[derive(Debug, Error)]
#[error("an output cache feature is already installed on this request")]
pub struct FeatureAlreadyInstalled;

/// Mutable coordination state of one request's trip through the cache.
///
/// Policies flip the allow flags, accumulate tags and vary-by rules, and set
/// the expiration; the middleware fills in the derived fields as the request
/// progresses.
#[derive(Debug)]
pub struct CacheContextState {
    /// A policy opted this request into output caching.
    pub enable_output_caching: bool,
    pub allow_cache_lookup: bool,
    pub allow_cache_storage: bool,
    pub allow_locking: bool,

    /// Memoized storage key; empty string means "not keyable".
    pub cache_key: Option<String>,
    pub vary: VaryRules,
    pub tags: BTreeSet<String>,
    /// Entry lifetime chosen by policies; the configured default applies
    /// when unset.
    pub response_expiration: Option<Duration>,

    pub response_time: Option<SystemTime>,
    pub entry_age: Option<Duration>,
    pub entry_fresh: bool,
    /// Latched by the first response byte; transitions false→true at most
    /// once per request.
    pub response_started: bool,
    /// The entry being served or captured.
    pub cached_response: Option<Arc<CacheEntry>>,

    /// Response facts snapshot, populated before the response-phase hooks.
    pub response_status: Option<StatusCode>,
    pub response_headers: HeaderMap,
}

impl CacheContextState {
    pub fn new() -> Self {
        Self {
            enable_output_caching: false,
            allow_cache_lookup: true,
            allow_cache_storage: true,
            allow_locking: true,
            cache_key: None,
            vary: VaryRules::default(),
            tags: BTreeSet::new(),
            response_expiration: None,
            response_time: None,
            entry_age: None,
            entry_fresh: true,
            response_started: false,
            cached_response: None,
            response_status: None,
            response_headers: HeaderMap::new(),
        }
    }
}

impl Default for CacheContextState {
    fn default() -> Self {
        Self::new()
    }
}

/// What policy hooks see: immutable request facts plus the shared mutable
/// state. Guards must not be held across await points.
pub struct CacheContext {
    method: Method,
    uri: Uri,
    request_headers: HeaderMap,
    state: Arc<Mutex<CacheContextState>>,
}

impl CacheContext {
    pub fn new<B>(request: &Request<B>, state: Arc<Mutex<CacheContextState>>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            request_headers: request.headers().clone(),
            state,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn state(&self) -> MutexGuard<'_, CacheContextState> {
        self.state.lock()
    }

    pub fn shared_state(&self) -> Arc<Mutex<CacheContextState>> {
        self.state.clone()
    }
}

/// Typed per-request handle stored in the request's extensions so nested
/// handlers can read and adjust the cache state mid-flight.
#[derive(Clone)]
pub struct CacheFeature {
    state: Arc<Mutex<CacheContextState>>,
}

impl CacheFeature {
    /// Attaches a feature to the request. At most one may be active per
    /// request; stacking two middleware instances is a wiring error.
    pub fn install(
        extensions: &mut Extensions,
        state: Arc<Mutex<CacheContextState>>,
    ) -> Result<(), FeatureAlreadyInstalled> {
        if extensions.get::<CacheFeature>().is_some() {
            return Err(FeatureAlreadyInstalled);
        }
        extensions.insert(CacheFeature { state });
        Ok(())
    }

    pub fn remove(extensions: &mut Extensions) {
        extensions.remove::<CacheFeature>();
    }

    pub fn get(extensions: &Extensions) -> Option<&CacheFeature> {
        extensions.get::<CacheFeature>()
    }

    pub fn state(&self) -> MutexGuard<'_, CacheContextState> {
        self.state.lock()
    }
}
