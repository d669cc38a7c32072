//! Freshness policy for cached edge sets.
//!
//! A cached edge set is served without a refresh while it is younger than
//! the configured maximum age. Callers can override the policy in either
//! direction, and the cache-only override always wins.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::data::never_synced;

/// Per-request overrides to the staleness policy.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOptions {
    /// Never trigger a refresh, even for stale or never-fetched data
    pub use_cache_only: bool,
    /// Refresh even if the cached data is fresh
    pub force_refresh: bool,
}

/// Whether an edge set fetched at `last_synced` needs a refresh at `now`.
///
/// `use_cache_only` suppresses refreshes unconditionally, including when
/// combined with `force_refresh`.
pub fn should_refresh(
    last_synced: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: Duration,
    options: &CacheOptions,
) -> bool {
    if options.use_cache_only {
        return false;
    }
    if options.force_refresh {
        return true;
    }

    let age = now.signed_duration_since(last_synced);
    age >= chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX)
}

/// Whether an edge set has ever been fetched.
pub fn never_fetched(last_synced: DateTime<Utc>) -> bool {
    last_synced == never_synced()
}
