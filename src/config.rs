use std::collections::HashMap;

use serde::Deserialize;

/// Number of network fetches allowed to run at once; further requests queue.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 3;

/// Media type a response must declare unless the check is disabled.
pub const DEFAULT_EXPECTED_CONTENT_TYPE: &str = "video/mp4";

/// Prefix of the outbound `Range` header value used when resuming.
pub const RANGE_HEADER_PREFIX: &str = "bytes=";

/// File extension of the complete payload artifact.
pub const DEFAULT_COMPLETE_SUFFIX: &str = "mp4";

/// File extension of the resumable partial artifact.
pub const DEFAULT_PARTIAL_SUFFIX: &str = "tmp";

/// How many times a loader session may evict and refetch after a failure.
pub const DEFAULT_RELOAD_RETRIES: u32 = 2;

/// Top-level configuration for the fetch coordinator and its cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding cache artifacts.
    pub cache_dir: String,
    /// Maximum number of simultaneous network transfers.
    pub max_concurrent_fetches: usize,
    /// Media type responses must carry. `None` accepts anything.
    pub expected_content_type: Option<String>,
    /// Extension for complete artifacts.
    pub complete_suffix: String,
    /// Extension for partial artifacts.
    pub partial_suffix: String,
    /// Extra headers sent with every request.
    pub request_headers: HashMap<String, String>,
}

impl EngineConfig {
    pub fn with_cache_dir(cache_dir: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            expected_content_type: Some(DEFAULT_EXPECTED_CONTENT_TYPE.to_string()),
            complete_suffix: DEFAULT_COMPLETE_SUFFIX.to_string(),
            partial_suffix: DEFAULT_PARTIAL_SUFFIX.to_string(),
            request_headers: HashMap::new(),
        }
    }
}
