mod support;

use std::time::Duration;

use anyhow::Result;
use http::Method;
use outcache::OutputCache;

use support::*;

async fn warmed_cache(upstream: &MockUpstream) -> Result<(OutputCache, std::sync::Arc<outcache::ManualClock>)> {
    let clock = manual_clock();
    let store = memory_store(clock.clone());
    let cache = build_cache(store, clock.clone());

    let mut sink = Vec::new();
    cache
        .handle(&mut get_request("http://origin/x"), &mut sink, upstream)
        .await?;
    assert_eq!(upstream.hits(), 1);
    clock.advance(Duration::from_secs(1));
    Ok((cache, clock))
}

#[tokio::test]
async fn matching_etag_serves_304_with_restricted_headers() -> Result<()> {
    let upstream = MockUpstream::new("hi")
        .with_header("etag", "\"v1\"")
        .with_header("content-type", "text/plain")
        .with_header("cache-control", "public, max-age=60");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("if-none-match", "\"v1\"")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;

    let response = parse_response(&sink);
    assert_eq!(response.status, 304);
    assert!(response.body.is_empty());
    assert_eq!(response.header("etag"), Some("\"v1\""));
    assert_eq!(response.header("cache-control"), Some("public, max-age=60"));
    assert!(response.header("date").is_some());
    assert!(
        response.header("content-type").is_none(),
        "304 must carry only the allowed header subset"
    );
    assert!(response.header("content-length").is_none());
    assert!(response.header("age").is_none());
    assert_eq!(upstream.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn weak_etag_matches_strong_cached_tag() -> Result<()> {
    let upstream = MockUpstream::new("hi").with_header("etag", "\"v1\"");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("if-none-match", "W/\"v1\"")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;
    assert_eq!(parse_response(&sink).status, 304);
    Ok(())
}

#[tokio::test]
async fn star_matches_any_cached_entry() -> Result<()> {
    let upstream = MockUpstream::new("hi");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request =
        request_with_headers(Method::GET, "http://origin/x", &[("if-none-match", "*")]);
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;
    assert_eq!(parse_response(&sink).status, 304);
    assert_eq!(upstream.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn mismatched_etag_serves_the_full_response() -> Result<()> {
    let upstream = MockUpstream::new("hi").with_header("etag", "\"v1\"");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("if-none-match", "\"v2\"")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;

    let response = parse_response(&sink);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "hi");
    assert_eq!(response.header("age"), Some("1"));
    assert_eq!(upstream.hits(), 1, "served from cache, not upstream");
    Ok(())
}

#[tokio::test]
async fn if_modified_since_serves_304_for_unchanged_resource() -> Result<()> {
    let upstream =
        MockUpstream::new("hi").with_header("last-modified", "Fri, 04 Nov 1994 08:49:37 GMT");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;
    assert_eq!(parse_response(&sink).status, 304);
    Ok(())
}

#[tokio::test]
async fn if_modified_since_serves_full_response_for_newer_resource() -> Result<()> {
    let upstream =
        MockUpstream::new("hi").with_header("last-modified", "Mon, 07 Nov 1994 08:49:37 GMT");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;

    let response = parse_response(&sink);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "hi");
    Ok(())
}

#[tokio::test]
async fn only_if_cached_on_a_cold_key_returns_504_without_upstream() -> Result<()> {
    let clock = manual_clock();
    let store = memory_store(clock.clone());
    let cache = build_cache(store, clock);
    let upstream = MockUpstream::new("hi");

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("cache-control", "only-if-cached")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;

    let response = parse_response(&sink);
    assert_eq!(response.status, 504);
    assert!(response.body.is_empty());
    assert_eq!(upstream.hits(), 0, "upstream must not be called");
    Ok(())
}

#[tokio::test]
async fn only_if_cached_serves_warm_entries_normally() -> Result<()> {
    let upstream = MockUpstream::new("hi");
    let (cache, _clock) = warmed_cache(&upstream).await?;

    let mut request = request_with_headers(
        Method::GET,
        "http://origin/x",
        &[("cache-control", "only-if-cached")],
    );
    let mut sink = Vec::new();
    cache.handle(&mut request, &mut sink, &upstream).await?;

    let response = parse_response(&sink);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "hi");
    assert_eq!(upstream.hits(), 1);
    Ok(())
}
