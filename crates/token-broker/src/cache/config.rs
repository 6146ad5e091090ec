//! Token cache configuration

use std::time::Duration;

/// Token cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether minted tokens are reused across requests
    pub enabled: bool,
    /// Maximum cached tokens across all principals
    pub max_entries: usize,
    /// Cached tokens closer than this to expiry are never served
    pub refresh_margin: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheConfig {
    pub const DEFAULT_MAX_ENTRIES: usize = 1024;
    pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: false,
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            refresh_margin: Self::DEFAULT_REFRESH_MARGIN,
        }
    }
}
