use std::time::{Duration, SystemTime};

use anyhow::{Result, bail};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of a captured response.
///
/// `headers` never contains `Age`; the middleware strips it at snapshot time
/// and recomputes it on every hit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub created: SystemTime,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub tags: Vec<String>,
}

// On-the-wire shape of an entry: a little-endian u32 metadata length, JSON
// metadata, then the raw body bytes. The body hash guards against a store
// handing back a truncated or mixed-up blob.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    created_unix_ms: u64,
    status: u16,
    headers: Vec<(String, String)>,
    tags: Vec<String>,
    body_len: u64,
    body_hash: String,
}

pub fn encode(entry: &CacheEntry) -> Result<Bytes> {
    let persisted = PersistedEntry {
        created_unix_ms: entry
            .created
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
        status: entry.status.as_u16(),
        headers: headermap_to_vec(&entry.headers),
        tags: entry.tags.clone(),
        body_len: entry.body.len() as u64,
        body_hash: blake3::hash(&entry.body).to_hex().to_string(),
    };
    let meta = serde_json::to_vec(&persisted)?;
    let meta_len = u32::try_from(meta.len())?;

    let mut frame = Vec::with_capacity(4 + meta.len() + entry.body.len());
    frame.extend_from_slice(&meta_len.to_le_bytes());
    frame.extend_from_slice(&meta);
    frame.extend_from_slice(&entry.body);
    Ok(Bytes::from(frame))
}

pub fn decode(blob: &[u8]) -> Result<CacheEntry> {
    if blob.len() < 4 {
        bail!("cache blob shorter than its length prefix");
    }
    let meta_len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    let Some(rest) = blob.get(4..) else {
        bail!("cache blob shorter than its length prefix");
    };
    if rest.len() < meta_len {
        bail!("cache blob truncated before metadata end");
    }
    let persisted: PersistedEntry = serde_json::from_slice(&rest[..meta_len])?;
    let body = &rest[meta_len..];

    if body.len() as u64 != persisted.body_len {
        bail!(
            "cache blob body length {} does not match recorded {}",
            body.len(),
            persisted.body_len
        );
    }
    if blake3::hash(body).to_hex().to_string() != persisted.body_hash {
        bail!("cache blob body hash mismatch");
    }

    Ok(CacheEntry {
        created: SystemTime::UNIX_EPOCH + Duration::from_millis(persisted.created_unix_ms),
        status: StatusCode::from_u16(persisted.status).unwrap_or(StatusCode::OK),
        headers: to_headermap(&persisted.headers),
        body: Bytes::copy_from_slice(body),
        tags: persisted.tags,
    })
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
