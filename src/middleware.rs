use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderValue, Method, Request, StatusCode};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::{debug, trace, warn};

use crate::cache_control::parse_cache_control;
use crate::clock::{Clock, SystemClock};
use crate::conditional::{NOT_MODIFIED_HEADERS, not_modified};
use crate::context::{CacheContext, CacheContextState, CacheFeature};
use crate::dispatcher::{DispatcherError, WorkDispatcher};
use crate::entry::{self, CacheEntry};
use crate::key;
use crate::metrics;
use crate::policy::{CachePolicy, EndpointPolicies};
use crate::response::ResponseWriter;
use crate::settings::OutputCacheSettings;
use crate::store::CacheStore;

/// The downstream application the cache sits in front of.
///
/// Implementations produce the response by setting status and headers on the
/// writer and streaming body bytes into it.
#[async_trait]
pub trait Handler<S>: Send + Sync
where
    S: AsyncWrite + Send + Unpin,
{
    async fn handle(
        &self,
        request: &Request<()>,
        response: &mut ResponseWriter<'_, S>,
    ) -> Result<()>;
}

/// The output cache middleware.
///
/// Built once and shared; every request flows through [`OutputCache::handle`],
/// which decides between serve-from-cache, execute-and-store, and
/// pass-through under the request's policy stack.
pub struct OutputCache {
    settings: OutputCacheSettings,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    base_policies: Vec<Arc<dyn CachePolicy>>,
    // Lookups and executions coalesce separately: an execution joining a
    // late lookup flight would observe "no entry" and run redundantly.
    lookup_dispatcher: WorkDispatcher<Option<Arc<CacheEntry>>>,
    execute_dispatcher: WorkDispatcher<Option<Arc<CacheEntry>>>,
}

pub struct OutputCacheBuilder {
    settings: OutputCacheSettings,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    base_policies: Vec<Arc<dyn CachePolicy>>,
}

impl OutputCacheBuilder {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            settings: OutputCacheSettings::default(),
            store,
            clock: Arc::new(SystemClock),
            base_policies: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: OutputCacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Appends a base policy; base policies run before endpoint policies.
    pub fn base_policy(mut self, policy: Arc<dyn CachePolicy>) -> Self {
        self.base_policies.push(policy);
        self
    }

    pub fn build(self) -> Result<OutputCache> {
        self.settings.validate()?;
        Ok(OutputCache {
            settings: self.settings,
            store: self.store,
            clock: self.clock,
            base_policies: self.base_policies,
            lookup_dispatcher: WorkDispatcher::new(),
            execute_dispatcher: WorkDispatcher::new(),
        })
    }
}

impl OutputCache {
    pub fn builder(store: Arc<dyn CacheStore>) -> OutputCacheBuilder {
        OutputCacheBuilder::new(store)
    }

    /// Runs one request through the cache.
    ///
    /// With no policies in play the handler is invoked untouched and the
    /// store is never consulted. Handler failures propagate to the caller
    /// after the per-request feature is removed; store and policy failures
    /// are logged and never fail the request.
    pub async fn handle<S, H>(
        &self,
        request: &mut Request<()>,
        sink: &mut S,
        handler: &H,
    ) -> Result<()>
    where
        S: AsyncWrite + Send + Unpin,
        H: Handler<S>,
    {
        let mut policies = self.base_policies.clone();
        if let Some(endpoint) = request.extensions().get::<EndpointPolicies>() {
            policies.extend(endpoint.0.iter().cloned());
        }
        if policies.is_empty() {
            trace!("no cache policies, bypassing");
            return pass_through(request, sink, handler).await;
        }

        let state = Arc::new(Mutex::new(CacheContextState::new()));
        CacheFeature::install(request.extensions_mut(), state.clone())?;
        let outcome = self
            .process(request, sink, handler, &policies, state)
            .await;
        CacheFeature::remove(request.extensions_mut());
        outcome
    }

    async fn process<S, H>(
        &self,
        request: &Request<()>,
        sink: &mut S,
        handler: &H,
        policies: &[Arc<dyn CachePolicy>],
        state: Arc<Mutex<CacheContextState>>,
    ) -> Result<()>
    where
        S: AsyncWrite + Send + Unpin,
        H: Handler<S>,
    {
        let mut ctx = CacheContext::new(request, state.clone());

        for policy in policies {
            if let Err(err) = policy.cache_request(&mut ctx).await {
                warn!(error = %err, "request-phase policy hook failed");
            }
        }

        let (enabled, allow_lookup, allow_storage, allow_locking) = {
            let state = state.lock();
            (
                state.enable_output_caching,
                state.allow_cache_lookup,
                state.allow_cache_storage,
                state.allow_locking,
            )
        };

        if enabled && allow_lookup {
            let key = self.ensure_key(&ctx);
            if key.is_empty() {
                debug!("request not keyable, lookup skipped");
                metrics::record_lookup("bypass");
            } else {
                match self.coalesced_lookup(&key).await {
                    Some(found) => {
                        metrics::record_lookup("hit");
                        if self.serve_cached(&mut ctx, found, policies, sink).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        debug!(key = %key, "lookup miss");
                        metrics::record_lookup("miss");
                    }
                }
            }
            if parse_cache_control(ctx.request_headers()).only_if_cached {
                debug!("only-if-cached with no fresh entry");
                return serve_gateway_timeout(sink).await;
            }
        }

        if enabled && allow_storage {
            let key = self.ensure_key(&ctx);
            if key.is_empty() {
                debug!("request not keyable, executing without capture");
                return pass_through(request, sink, handler).await;
            }

            if allow_locking {
                let scheduled = self
                    .execute_dispatcher
                    .schedule(
                        &key,
                        self.execute_and_capture(request, sink, handler, &mut ctx, policies, &key),
                    )
                    .await;
                match scheduled {
                    Ok(scheduled) if scheduled.executed => {
                        metrics::record_coalesced("leader");
                        return Ok(());
                    }
                    Ok(scheduled) => {
                        metrics::record_coalesced("waiter");
                        if let Some(produced) = scheduled.value
                            && self.serve_cached(&mut ctx, produced, policies, sink).await?
                        {
                            return Ok(());
                        }
                        // The produced entry was unusable for this request;
                        // exactly one unlocked execution, never a second
                        // locked one.
                        self.execute_and_capture(request, sink, handler, &mut ctx, policies, &key)
                            .await?;
                        return Ok(());
                    }
                    Err(err @ DispatcherError::Failed { .. }) => {
                        // Owner and waiters surface the one shared failure;
                        // re-running the handler here would reintroduce the
                        // herd the dispatcher exists to prevent.
                        return Err(err.into_owned_error());
                    }
                    Err(err @ DispatcherError::OwnerAbandoned) => {
                        debug!(error = %err, "execution owner went away, running unlocked");
                        self.execute_and_capture(request, sink, handler, &mut ctx, policies, &key)
                            .await?;
                        return Ok(());
                    }
                }
            }

            self.execute_and_capture(request, sink, handler, &mut ctx, policies, &key)
                .await?;
            return Ok(());
        }

        pass_through(request, sink, handler).await
    }

    // Computes and memoizes the storage key. Empty means "not keyable".
    fn ensure_key(&self, ctx: &CacheContext) -> String {
        let mut state = ctx.state();
        if let Some(key) = &state.cache_key {
            return key.clone();
        }
        let key = key::storage_key(
            ctx.method(),
            ctx.uri(),
            ctx.request_headers(),
            &state.vary,
            self.settings.case_insensitive_vary_values,
        );
        state.cache_key = Some(key.clone());
        key
    }

    // Store read coalesced per key; every failure degrades to a miss.
    async fn coalesced_lookup(&self, lookup_key: &str) -> Option<Arc<CacheEntry>> {
        let store = self.store.clone();
        let owned_key = lookup_key.to_string();
        let result = self
            .lookup_dispatcher
            .schedule(lookup_key, async move {
                match store.get(&owned_key).await {
                    Ok(Some(blob)) => match entry::decode(&blob) {
                        Ok(found) => Ok(Some(Arc::new(found))),
                        Err(err) => {
                            warn!(key = %owned_key, error = %err, "stored entry undecodable, treating as miss");
                            Ok(None)
                        }
                    },
                    Ok(None) => Ok(None),
                    Err(err) => {
                        warn!(key = %owned_key, error = %err, "store read failed, treating as miss");
                        Ok(None)
                    }
                }
            })
            .await;
        match result {
            Ok(scheduled) => scheduled.value,
            Err(err) => {
                debug!(error = %err, "coalesced lookup failed, treating as miss");
                None
            }
        }
    }

    /// Serves `found` if it survives freshness and policy review. Returns
    /// false when the caller should fall back to executing the request.
    async fn serve_cached<S>(
        &self,
        ctx: &mut CacheContext,
        found: Arc<CacheEntry>,
        policies: &[Arc<dyn CachePolicy>],
        sink: &mut S,
    ) -> Result<bool>
    where
        S: AsyncWrite + Send + Unpin,
    {
        let now = self.clock.now();
        {
            let mut state = ctx.state();
            state.response_time = Some(now);
            let age = now.duration_since(found.created).unwrap_or(Duration::ZERO);
            state.entry_age = Some(age);
            // A zero age means the entry claims to be from the future; do
            // not trust it.
            state.entry_fresh = !age.is_zero();
            state.cached_response = Some(found.clone());
        }

        for policy in policies {
            if let Err(err) = policy.serve_from_cache(&mut *ctx).await {
                warn!(error = %err, "serve-phase policy hook failed");
            }
        }
        if !ctx.state().entry_fresh {
            debug!("cached entry not fresh, falling through");
            return Ok(false);
        }

        if not_modified(ctx.request_headers(), &found.headers) {
            debug!("conditional hit, serving 304");
            metrics::record_not_modified();
            let mut writer = ResponseWriter::new(sink);
            writer.set_status(StatusCode::NOT_MODIFIED)?;
            {
                let headers = writer.headers_mut()?;
                for name in NOT_MODIFIED_HEADERS {
                    for value in found.headers.get_all(&name) {
                        headers.append(name.clone(), value.clone());
                    }
                }
            }
            writer.finish().await?;
            return Ok(true);
        }

        let age_secs = ctx.state().entry_age.unwrap_or_default().as_secs();
        debug!(age_secs, "serving from cache");
        let mut writer = ResponseWriter::new(sink);
        writer.set_status(found.status)?;
        {
            let headers = writer.headers_mut()?;
            for (name, value) in &found.headers {
                headers.append(name.clone(), value.clone());
            }
            headers.insert(http::header::AGE, HeaderValue::from(age_secs));
        }
        if let Err(err) = write_and_finish(&mut writer, &found.body).await {
            // Mid-body disconnects cannot be retried or repaired; the
            // request counts as served.
            warn!(error = %err, "client went away mid-body, treating as served");
        }
        Ok(true)
    }

    // Runs the downstream handler with the capture stream installed, then
    // finalizes headers and body and persists the entry when allowed. The
    // return value is what coalesced waiters receive.
    async fn execute_and_capture<S, H>(
        &self,
        request: &Request<()>,
        sink: &mut S,
        handler: &H,
        ctx: &mut CacheContext,
        policies: &[Arc<dyn CachePolicy>],
        store_key: &str,
    ) -> Result<Option<Arc<CacheEntry>>>
    where
        S: AsyncWrite + Send + Unpin,
        H: Handler<S>,
    {
        let mut writer = ResponseWriter::new(sink);
        writer.enable_capture(self.settings.max_body_size);

        let latch_state = ctx.shared_state();
        let latch_clock = self.clock.clone();
        writer.set_on_start(Box::new(move || {
            let mut state = latch_state.lock();
            if !state.response_started {
                state.response_started = true;
                state.response_time = Some(latch_clock.now());
            }
        }));
        // Date accompanies storage: it is armed only while storage is
        // allowed and re-checked at stamp time, so a response whose storage
        // a response-phase hook revokes before the head goes out carries no
        // synthesized Date. A revocation after the first body byte cannot
        // un-send it.
        if ctx.state().allow_cache_storage {
            let date_state = ctx.shared_state();
            let date_clock = self.clock.clone();
            writer.set_date_source(Box::new(move || {
                let state = date_state.lock();
                if !state.allow_cache_storage {
                    return None;
                }
                let response_time = state.response_time.unwrap_or_else(|| date_clock.now());
                Some(
                    HeaderValue::from_str(&httpdate::fmt_http_date(response_time))
                        .expect("http dates are valid header values"),
                )
            }));
        }

        handler.handle(request, &mut writer).await?;

        {
            let mut state = ctx.state();
            if state.response_time.is_none() {
                state.response_time = Some(self.clock.now());
            }
            state.response_status = Some(writer.status());
            state.response_headers = writer.headers().clone();
        }
        for policy in policies {
            if let Err(err) = policy.serve_response(&mut *ctx).await {
                warn!(error = %err, "response-phase policy hook failed");
            }
        }

        let (allow_storage, response_time, expiration, tags) = {
            let state = ctx.state();
            (
                state.allow_cache_storage,
                state.response_time.expect("set above"),
                state.response_expiration,
                state.tags.iter().cloned().collect::<Vec<_>>(),
            )
        };

        if !allow_storage {
            writer.disable_buffering();
            writer.finish().await?;
            return Ok(None);
        }

        writer.finish().await?;

        if !writer.buffering_enabled() {
            debug!("body passed the capture ceiling, not storing");
            metrics::record_store("skipped");
            return Ok(None);
        }

        let body = writer.captured_body();
        let mut headers = writer.headers().clone();
        headers.remove(http::header::AGE);

        match declared_content_length(&headers) {
            Err(err) => {
                debug!(error = %err, "unparseable content-length, not storing");
                metrics::record_store("skipped");
                return Ok(None);
            }
            Ok(Some(declared)) if declared != body.len() as u64 => {
                // A HEAD response legitimately describes a body it does not
                // carry; everything else is a mismatch.
                if !(*ctx.method() == Method::HEAD && body.is_empty()) {
                    debug!(
                        declared,
                        actual = body.len(),
                        "content-length disagrees with body, not storing"
                    );
                    metrics::record_store("skipped");
                    return Ok(None);
                }
            }
            Ok(None) => {
                if !headers.contains_key(http::header::TRANSFER_ENCODING) {
                    headers.insert(
                        http::header::CONTENT_LENGTH,
                        HeaderValue::from(body.len() as u64),
                    );
                }
            }
            Ok(Some(_)) => {}
        }

        let produced = Arc::new(CacheEntry {
            created: response_time,
            status: writer.status(),
            headers,
            body,
            tags: tags.clone(),
        });
        ctx.state().cached_response = Some(produced.clone());

        let ttl = expiration.unwrap_or_else(|| self.settings.default_expiration());
        match entry::encode(&produced) {
            Ok(blob) => match self.store.set(store_key, blob, &tags, ttl).await {
                Ok(()) => {
                    debug!(key = %store_key, ttl_secs = ttl.as_secs(), "stored cache entry");
                    metrics::record_store("stored");
                }
                Err(err) => {
                    warn!(key = %store_key, error = %err, "failed to store cache entry");
                    metrics::record_store("failed");
                }
            },
            Err(err) => {
                warn!(key = %store_key, error = %err, "failed to serialize cache entry");
                metrics::record_store("failed");
            }
        }

        Ok(Some(produced))
    }
}

async fn pass_through<S, H>(request: &Request<()>, sink: &mut S, handler: &H) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
    H: Handler<S>,
{
    let mut writer = ResponseWriter::new(sink);
    handler.handle(request, &mut writer).await?;
    writer.finish().await
}

async fn serve_gateway_timeout<S>(sink: &mut S) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    metrics::record_gateway_timeout();
    let mut writer = ResponseWriter::new(sink);
    writer.set_status(StatusCode::GATEWAY_TIMEOUT)?;
    writer
        .headers_mut()?
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    writer.finish().await
}

async fn write_and_finish<S>(writer: &mut ResponseWriter<'_, S>, body: &[u8]) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    writer.write_body(body).await?;
    writer.finish().await
}

fn declared_content_length(headers: &http::HeaderMap) -> Result<Option<u64>> {
    match headers.get(http::header::CONTENT_LENGTH) {
        Some(value) => {
            let length = value.to_str()?.trim().parse::<u64>()?;
            Ok(Some(length))
        }
        None => Ok(None),
    }
}
