use std::time::Duration;

use anyhow::{Result, ensure};
use serde::Deserialize;

fn default_max_body_size() -> u64 {
    64 * 1024 * 1024
}

fn default_expiration_secs() -> u64 {
    60
}

fn default_case_insensitive_vary_values() -> bool {
    false
}

/// Tunable knobs of the output cache.
///
/// Deserializable so hosts can embed it in their own configuration files.
/// The clock and the base policy list are constructor arguments of
/// [`OutputCache`](crate::middleware::OutputCache), not settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputCacheSettings {
    /// Largest response body, in bytes, that will be buffered for storage.
    /// Responses that grow past this are forwarded but never cached.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// Entry lifetime applied when no policy supplies one, in seconds.
    #[serde(default = "default_expiration_secs")]
    pub default_expiration_secs: u64,
    /// Fold vary-by query and header values to lowercase before they enter
    /// the storage key. Names are always matched case-insensitively.
    #[serde(default = "default_case_insensitive_vary_values")]
    pub case_insensitive_vary_values: bool,
}

impl Default for OutputCacheSettings {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            default_expiration_secs: default_expiration_secs(),
            case_insensitive_vary_values: default_case_insensitive_vary_values(),
        }
    }
}

impl OutputCacheSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_body_size > 0, "max_body_size must be greater than zero");
        Ok(())
    }

    pub fn default_expiration(&self) -> Duration {
        Duration::from_secs(self.default_expiration_secs)
    }
}
