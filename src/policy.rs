use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use http::{Method, StatusCode};

use crate::cache_control::{freshness_lifetime, parse_cache_control};
use crate::context::CacheContext;

/// A unit of caching policy, invoked at three points of a request's life.
///
/// Hooks run strictly in order within one request and may flip the allow
/// flags, add tags and vary-by rules, adjust the expiration, or veto serving
/// and storing. Hook failures are logged by the middleware and never fail
/// the request.
#[async_trait]
pub trait CachePolicy: Send + Sync {
    /// Request phase, before any cache interaction.
    async fn cache_request(&self, _ctx: &mut CacheContext) -> Result<()> {
        Ok(())
    }

    /// A fresh candidate entry was found; may mark it not fresh.
    async fn serve_from_cache(&self, _ctx: &mut CacheContext) -> Result<()> {
        Ok(())
    }

    /// The downstream handler ran; may revoke storage now that the response
    /// is known.
    async fn serve_response(&self, _ctx: &mut CacheContext) -> Result<()> {
        Ok(())
    }
}

/// Policies attached to a single endpoint, read from the request extensions.
/// Evaluated after the middleware's base policies, in order.
#[derive(Clone, Default)]
pub struct EndpointPolicies(pub Vec<Arc<dyn CachePolicy>>);

impl EndpointPolicies {
    pub fn new(policies: Vec<Arc<dyn CachePolicy>>) -> Self {
        Self(policies)
    }
}

/// The sensible default: caches safe requests, refuses responses a shared
/// cache must not hold.
///
/// Enables caching for GET and HEAD requests without an `Authorization`
/// header; after the handler runs, revokes storage for non-200 responses and
/// anything carrying `Set-Cookie`.
pub struct BasePolicy;

#[async_trait]
impl CachePolicy for BasePolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        let cacheable_method = *ctx.method() == Method::GET || *ctx.method() == Method::HEAD;
        let authorized = ctx
            .request_headers()
            .contains_key(http::header::AUTHORIZATION);
        if cacheable_method && !authorized {
            ctx.state().enable_output_caching = true;
        }
        Ok(())
    }

    async fn serve_response(&self, ctx: &mut CacheContext) -> Result<()> {
        let mut state = ctx.state();
        let ok = state.response_status == Some(StatusCode::OK);
        let sets_cookie = state.response_headers.contains_key(http::header::SET_COOKIE);
        if !ok || sets_cookie {
            state.allow_cache_storage = false;
        }
        Ok(())
    }
}

/// Fixed entry lifetime.
pub struct ExpirationPolicy(pub Duration);

#[async_trait]
impl CachePolicy for ExpirationPolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        ctx.state().response_expiration = Some(self.0);
        Ok(())
    }
}

/// Derives the entry lifetime from the response's own freshness headers and
/// refuses to store responses that opt out of shared caching.
pub struct HeaderLifetimePolicy;

#[async_trait]
impl CachePolicy for HeaderLifetimePolicy {
    async fn serve_response(&self, ctx: &mut CacheContext) -> Result<()> {
        let mut state = ctx.state();
        let directives = parse_cache_control(&state.response_headers);
        if directives.no_store || directives.no_cache || directives.private {
            state.allow_cache_storage = false;
            return Ok(());
        }
        if state.response_expiration.is_none()
            && let Some(response_time) = state.response_time
            && let Some(lifetime) = freshness_lifetime(&state.response_headers, response_time)
        {
            if lifetime.is_zero() {
                state.allow_cache_storage = false;
            } else {
                state.response_expiration = Some(lifetime);
            }
        }
        Ok(())
    }
}

/// Attaches fixed tags to whatever this request stores.
pub struct TagPolicy(pub Vec<String>);

#[async_trait]
impl CachePolicy for TagPolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        let mut state = ctx.state();
        for tag in &self.0 {
            state.tags.insert(tag.clone());
        }
        Ok(())
    }
}

/// Keys separately per value of the named query parameters.
pub struct VaryByQueryPolicy(pub Vec<String>);

#[async_trait]
impl CachePolicy for VaryByQueryPolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        let mut state = ctx.state();
        for name in &self.0 {
            state.vary.add_query_key(name.clone());
        }
        Ok(())
    }
}

/// Keys separately per value of the named request headers.
pub struct VaryByHeaderPolicy(pub Vec<String>);

#[async_trait]
impl CachePolicy for VaryByHeaderPolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        let mut state = ctx.state();
        for name in &self.0 {
            state.vary.add_header(name.clone());
        }
        Ok(())
    }
}

/// Keys separately per host-supplied value, e.g. a tenant or a route binding.
pub struct VaryByValuePolicy {
    pub name: String,
    pub value: String,
}

#[async_trait]
impl CachePolicy for VaryByValuePolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        ctx.state()
            .vary
            .set_value(self.name.clone(), self.value.clone());
        Ok(())
    }
}

/// Serve from cache if possible, never store.
pub struct NoStorePolicy;

#[async_trait]
impl CachePolicy for NoStorePolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        ctx.state().allow_cache_storage = false;
        Ok(())
    }
}

/// Store, but never serve from cache.
pub struct NoLookupPolicy;

#[async_trait]
impl CachePolicy for NoLookupPolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        ctx.state().allow_cache_lookup = false;
        Ok(())
    }
}

/// Execute without per-key coalescing.
pub struct NoLockingPolicy;

#[async_trait]
impl CachePolicy for NoLockingPolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        ctx.state().allow_locking = false;
        Ok(())
    }
}

/// Turns caching off for matching endpoints even when a base policy enabled
/// it.
pub struct DisableCachePolicy;

#[async_trait]
impl CachePolicy for DisableCachePolicy {
    async fn cache_request(&self, ctx: &mut CacheContext) -> Result<()> {
        ctx.state().enable_output_caching = false;
        Ok(())
    }
}
