use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Key prefix that selects the discovery TTL for [`TtlClass::Default`].
pub(crate) const DISCOVERY_PREFIX: &str = "discovery:";

/// Which TTL policy produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Library default, or the discovery TTL when the key starts with `discovery:`.
    Default,
    /// A positive validation result.
    Success,
    /// A negative validation result; kept briefly so failures are retried soon.
    Failure,
    /// A discovery result.
    Discovery,
    /// Caller-supplied TTL.
    Custom(Duration),
}

impl TtlClass {
    /// Resolves the class for `key`, applying the `discovery:` prefix rule.
    pub(crate) fn resolve(self, key: &str) -> TtlClass {
        match self {
            TtlClass::Default if key.starts_with(DISCOVERY_PREFIX) => TtlClass::Discovery,
            other => other,
        }
    }

    pub(crate) fn ttl(self, config: &CacheConfig) -> Duration {
        match self {
            TtlClass::Default => config.default_ttl,
            TtlClass::Success => config.success_ttl,
            TtlClass::Failure => config.failure_ttl,
            TtlClass::Discovery => config.discovery_ttl,
            TtlClass::Custom(ttl) => ttl,
        }
    }
}

/// One cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub ttl: Duration,
    pub class: TtlClass,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// Approximate footprint of key plus data.
    pub size_bytes: usize,
}

impl CacheEntry {
    /// Visible iff `now < created_at + ttl`. Compared as elapsed time so a
    /// TTL of any length never overflows `Instant`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Budgets and TTLs. TTL changes apply to entries created afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_size_bytes: usize,
    pub max_entries: usize,
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub discovery_ttl: Duration,
    pub default_ttl: Duration,
    /// Period of the background expiry sweep. Zero disables the timer.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            max_entries: 1000,
            success_ttl: Duration::from_secs(60 * 60),
            failure_ttl: Duration::from_secs(5 * 60),
            discovery_ttl: Duration::from_secs(24 * 60 * 60),
            default_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Partial update for [`ValidationCache::configure`](super::ValidationCache::configure).
#[derive(Debug, Clone, Default)]
pub struct CacheConfigUpdate {
    pub max_size_bytes: Option<usize>,
    pub max_entries: Option<usize>,
    pub success_ttl: Option<Duration>,
    pub failure_ttl: Option<Duration>,
    pub discovery_ttl: Option<Duration>,
    pub default_ttl: Option<Duration>,
    pub cleanup_interval: Option<Duration>,
}

impl CacheConfig {
    /// Merges `update` in place. Returns true if the cleanup interval changed.
    pub(crate) fn merge(&mut self, update: CacheConfigUpdate) -> bool {
        let before = self.cleanup_interval;
        if let Some(v) = update.max_size_bytes {
            self.max_size_bytes = v;
        }
        if let Some(v) = update.max_entries {
            self.max_entries = v;
        }
        if let Some(v) = update.success_ttl {
            self.success_ttl = v;
        }
        if let Some(v) = update.failure_ttl {
            self.failure_ttl = v;
        }
        if let Some(v) = update.discovery_ttl {
            self.discovery_ttl = v;
        }
        if let Some(v) = update.default_ttl {
            self.default_ttl = v;
        }
        if let Some(v) = update.cleanup_interval {
            self.cleanup_interval = v;
        }
        before != self.cleanup_interval
    }
}

/// Resident entries bucketed by the TTL class that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TtlDistribution {
    pub success: usize,
    pub failure: usize,
    pub discovery: usize,
    pub custom: usize,
    pub default: usize,
}

impl TtlDistribution {
    pub(crate) fn add(&mut self, class: TtlClass) {
        match class {
            TtlClass::Success => self.success += 1,
            TtlClass::Failure => self.failure += 1,
            TtlClass::Discovery => self.discovery += 1,
            TtlClass::Custom(_) => self.custom += 1,
            TtlClass::Default => self.default += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Percentage of `get` calls that hit, rounded to two decimals.
    pub hit_rate: f64,
    pub ttl_distribution: TtlDistribution,
    /// `total_size_bytes` for humans, e.g. `"12.50 KB"`.
    pub memory_usage: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_class_infers_discovery_from_prefix() {
        assert_eq!(
            TtlClass::Default.resolve("discovery:https://a/"),
            TtlClass::Discovery
        );
        assert_eq!(TtlClass::Default.resolve("validate:https://a/"), TtlClass::Default);
        assert_eq!(TtlClass::Failure.resolve("discovery:x"), TtlClass::Failure);
    }

    #[test]
    fn test_merge_reports_interval_change() {
        let mut config = CacheConfig::default();
        assert!(!config.merge(CacheConfigUpdate {
            max_entries: Some(5),
            ..Default::default()
        }));
        assert_eq!(config.max_entries, 5);

        assert!(config.merge(CacheConfigUpdate {
            cleanup_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        }));
    }
}
