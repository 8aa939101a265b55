use std::time::SystemTime;

use http::header::{
    CACHE_CONTROL, CONTENT_LOCATION, DATE, ETAG, EXPIRES, HeaderMap, HeaderName, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, VARY,
};

/// Headers a 304 response may carry, per RFC 9110 §15.4.5.
pub const NOT_MODIFIED_HEADERS: [HeaderName; 6] = [
    CACHE_CONTROL,
    CONTENT_LOCATION,
    DATE,
    ETAG,
    EXPIRES,
    VARY,
];

/// Decides whether a fresh hit can be answered with 304 Not Modified.
///
/// `If-None-Match` wins over `If-Modified-Since`: when the request carries
/// entity tags, the modification date is not consulted at all.
pub fn not_modified(request: &HeaderMap, cached: &HeaderMap) -> bool {
    if request.contains_key(IF_NONE_MATCH) {
        let raw = joined_values(request, &IF_NONE_MATCH);
        if raw.trim() == "*" {
            return true;
        }
        let Some(cached_tag) = cached.get(ETAG).and_then(|value| value.to_str().ok()) else {
            return false;
        };
        return raw
            .split(',')
            .any(|candidate| weak_tag_match(candidate, cached_tag));
    }

    if let Some(since) = request.get(IF_MODIFIED_SINCE)
        && let Ok(since) = since.to_str()
        && let Ok(since) = httpdate::parse_http_date(since)
        && let Some(modified) = cached_modified_time(cached)
    {
        return modified <= since;
    }

    false
}

// The resource's modification time: Last-Modified, falling back to Date.
fn cached_modified_time(cached: &HeaderMap) -> Option<SystemTime> {
    for name in [LAST_MODIFIED, DATE] {
        if let Some(value) = cached.get(&name)
            && let Ok(value) = value.to_str()
            && let Ok(parsed) = httpdate::parse_http_date(value)
        {
            return Some(parsed);
        }
    }
    None
}

// Weak comparison (RFC 9110 §8.8.3.2): a weakness prefix on either side is
// ignored, the opaque tags must match byte for byte.
fn weak_tag_match(candidate: &str, cached: &str) -> bool {
    let candidate = strip_weakness(candidate.trim());
    let cached = strip_weakness(cached.trim());
    !candidate.is_empty() && candidate == cached
}

fn strip_weakness(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

fn joined_values(headers: &HeaderMap, name: &HeaderName) -> String {
    let mut joined = String::new();
    for value in headers.get_all(name) {
        if let Ok(value) = value.to_str() {
            if !joined.is_empty() {
                joined.push(',');
            }
            joined.push_str(value);
        }
    }
    joined
}
