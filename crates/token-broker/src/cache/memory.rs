//! In-memory token cache with expiry-aware eviction

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use super::config::CacheConfig;
use crate::types::{PrincipalId, ScopedAccessToken};

/// `None` is the caller's default permission
type CacheKey = (PrincipalId, Option<String>);

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Thread-safe token cache
///
/// When full, the entry closest to expiry is evicted first.
pub struct TokenCache {
    entries: RwLock<HashMap<CacheKey, ScopedAccessToken>>,
    max_entries: usize,
    refresh_margin: chrono::Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("max_entries", &self.max_entries)
            .field("refresh_margin", &self.refresh_margin)
            .field("entry_count", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
            refresh_margin: chrono::Duration::from_std(config.refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cached token that stays valid for at least the refresh margin.
    pub fn get(&self, principal: &PrincipalId, permission: Option<&str>) -> Option<ScopedAccessToken> {
        let key = (principal.clone(), permission.map(ToString::to_string));
        let now = Utc::now();

        let found = self
            .entries
            .read()
            .get(&key)
            .filter(|token| token.is_fresh_at(now, self.refresh_margin))
            .cloned();

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "metrics")]
            crate::observability::record_cache_hit();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "metrics")]
            crate::observability::record_cache_miss();
        }
        found
    }

    /// Store a token. Tokens already inside the refresh margin are not cached.
    pub fn insert(
        &self,
        principal: &PrincipalId,
        permission: Option<&str>,
        token: &ScopedAccessToken,
    ) {
        let now = Utc::now();
        if !token.is_fresh_at(now, self.refresh_margin) {
            return;
        }

        let key = (principal.clone(), permission.map(ToString::to_string));
        let mut entries = self.entries.write();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.retain(|_, t| t.is_fresh_at(now, self.refresh_margin));

            if entries.len() >= self.max_entries
                && let Some(victim) = entries
                    .iter()
                    .min_by_key(|(_, t)| t.expires_at)
                    .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(key, token.clone());
    }

    /// Drop every cached token for `principal`. Returns the number removed.
    pub fn invalidate_principal(&self, principal: &PrincipalId) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(p, _), _| p != principal);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
