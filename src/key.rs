use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, Method, Uri};

// Field and record separators for key segments. Neither byte can appear in
// header names, header values, or a raw query string, so segment boundaries
// stay unambiguous.
const FIELD_SEP: char = '\u{1f}';
const ABSENT: &str = "\u{2}";

/// Request attributes that feed the storage key beyond method and URI.
///
/// Policies accumulate these during the request phase; the key provider folds
/// them in with sorted, case-folded names so rule order never changes the key.
#[derive(Debug, Clone, Default)]
pub struct VaryRules {
    query_keys: Vec<String>,
    header_names: Vec<String>,
    route_values: BTreeMap<String, String>,
    values: BTreeMap<String, String>,
}

impl VaryRules {
    pub fn add_query_key(&mut self, name: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        if !self.query_keys.contains(&name) {
            self.query_keys.push(name);
        }
    }

    pub fn add_header(&mut self, name: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        if !self.header_names.contains(&name) {
            self.header_names.push(name);
        }
    }

    pub fn set_route_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.route_values
            .insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.query_keys.is_empty()
            && self.header_names.is_empty()
            && self.route_values.is_empty()
            && self.values.is_empty()
    }
}

/// Derives the storage key for a request.
///
/// Returns an empty string when the request carries no usable host, which
/// callers treat as "skip the cache". Two requests agreeing on every covered
/// attribute map to the same key; the key is the full fingerprint, never a
/// hash of it.
pub fn storage_key(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    rules: &VaryRules,
    case_insensitive_values: bool,
) -> String {
    let host = match uri.host().map(str::to_owned).or_else(|| host_header(headers)) {
        Some(host) => host.to_ascii_lowercase(),
        None => return String::new(),
    };
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();

    let mut key = String::with_capacity(64);
    key.push_str(method.as_str());
    key.push(FIELD_SEP);
    key.push_str(&scheme);
    key.push(FIELD_SEP);
    key.push_str(&host);
    key.push(FIELD_SEP);
    key.push_str(uri.path());

    let fold = |value: String| {
        if case_insensitive_values {
            value.to_ascii_lowercase()
        } else {
            value
        }
    };

    let mut query_keys = rules.query_keys.clone();
    query_keys.sort();
    for name in &query_keys {
        let value = query_value(uri.query(), name).map(&fold);
        push_segment(&mut key, 'Q', name, value.as_deref());
    }

    let mut header_names = rules.header_names.clone();
    header_names.sort();
    for name in &header_names {
        let value = header_value(headers, name).map(&fold);
        push_segment(&mut key, 'H', name, value.as_deref());
    }

    for (name, value) in &rules.route_values {
        push_segment(&mut key, 'R', name, Some(value));
    }

    for (name, value) in &rules.values {
        push_segment(&mut key, 'V', name, Some(value));
    }

    key
}

fn push_segment(key: &mut String, kind: char, name: &str, value: Option<&str>) {
    key.push(FIELD_SEP);
    key.push(kind);
    key.push(FIELD_SEP);
    key.push_str(name);
    key.push('=');
    key.push_str(value.unwrap_or(ABSENT));
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

// Collects every value of a query parameter, comma-joined, matching the name
// case-insensitively against the raw query string.
fn query_value(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    let mut values = Vec::new();
    for pair in query.split('&') {
        let (candidate, value) = match pair.split_once('=') {
            Some((candidate, value)) => (candidate, value),
            None => (pair, ""),
        };
        if candidate.eq_ignore_ascii_case(name) {
            values.push(value);
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let name = HeaderName::try_from(name).ok()?;
    let mut values = Vec::new();
    for value in headers.get_all(&name) {
        if let Ok(value) = value.to_str() {
            values.push(value);
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}
