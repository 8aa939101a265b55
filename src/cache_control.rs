use std::time::{Duration, SystemTime};

use http::HeaderMap;

/// Cache-Control directives this crate reacts to, on either side of the
/// exchange.
#[derive(Debug, Clone, Default)]
pub struct CacheDirectives {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub only_if_cached: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheDirectives {
    let mut directives = CacheDirectives::default();

    for value in headers.get_all(http::header::CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                if part.eq_ignore_ascii_case("public") {
                    directives.public = true;
                } else if part.eq_ignore_ascii_case("private") {
                    directives.private = true;
                } else if part.eq_ignore_ascii_case("no-cache") {
                    directives.no_cache = true;
                } else if part.eq_ignore_ascii_case("no-store") {
                    directives.no_store = true;
                } else if part.eq_ignore_ascii_case("only-if-cached") {
                    directives.only_if_cached = true;
                } else if let Some(stripped) = part.strip_prefix("max-age=") {
                    if let Ok(secs) = stripped.parse::<u64>() {
                        directives.max_age = Some(Duration::from_secs(secs));
                    }
                } else if let Some(stripped) = part.strip_prefix("s-maxage=")
                    && let Ok(secs) = stripped.parse::<u64>()
                {
                    directives.s_maxage = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    directives
}

/// Freshness lifetime advertised by a response: `s-maxage`, then `max-age`,
/// then `Expires` relative to `now`.
pub fn freshness_lifetime(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let directives = parse_cache_control(headers);

    if let Some(s_maxage) = directives.s_maxage {
        return Some(s_maxage);
    }
    if let Some(max_age) = directives.max_age {
        return Some(max_age);
    }

    if let Some(expires) = headers.get(http::header::EXPIRES)
        && let Ok(expires) = expires.to_str()
        && let Ok(expires_at) = httpdate::parse_http_date(expires)
    {
        return Some(expires_at.duration_since(now).unwrap_or(Duration::ZERO));
    }

    None
}
