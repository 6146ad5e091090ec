//! Per-principal token cache
//!
//! Optional. When enabled, a token minted for (principal, permission) is reused
//! until it comes within `refresh_margin` of its expiry. Entries for a
//! principal are dropped whenever the store rejects a mint for it.

mod config;
mod memory;

pub use config::CacheConfig;
pub use memory::{CacheStats, TokenCache};
