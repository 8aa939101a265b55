#![no_main]

use std::time::SystemTime;

use http::{HeaderMap, HeaderValue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = HeaderValue::from_bytes(data) {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, value);
        let _ = outcache::cache_control::parse_cache_control(&headers);
        let _ = outcache::cache_control::freshness_lifetime(&headers, SystemTime::UNIX_EPOCH);
    }
});
