use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const CACHE_PREFIX: &str = "cache_";

pub(crate) fn cache_key(key: &str) -> String {
    format!("{CACHE_PREFIX}{key}")
}

/// Stored form of a cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub data: Value,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A missing or zero max age means no limit.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        let elapsed = (now - self.cached_at).to_std().unwrap_or(Duration::ZERO);
        max_age
            .filter(|max_age| !max_age.is_zero())
            .map_or(true, |max_age| elapsed < max_age)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedData<T> {
    pub data: Option<T>,
    pub is_fresh: bool,
}

impl<T> CachedData<T> {
    pub fn missing() -> Self {
        Self {
            data: None,
            is_fresh: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn freshness_window() {
        let cached_at = Utc::now();
        let entry = CacheEntry {
            data: json!({"temp": 24}),
            cached_at,
        };
        let later = cached_at + chrono::Duration::seconds(30);
        assert!(entry.is_fresh(later, None));
        assert!(entry.is_fresh(later, Some(Duration::from_secs(31))));
        assert!(!entry.is_fresh(later, Some(Duration::from_secs(30))));
        assert!(entry.is_fresh(later, Some(Duration::ZERO)));
        // Clock skew into the past counts as zero elapsed.
        assert!(entry.is_fresh(
            cached_at - chrono::Duration::seconds(5),
            Some(Duration::from_secs(1))
        ));
    }
}
