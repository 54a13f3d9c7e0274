use chrono::Utc;
use secrecy::SecretString;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::registry::{Cooldown, ProxyRecord};
use super::{ProxyDescriptor, ProxyError, ProxyRegistry, ProxyStats};
use crate::storage::KeyValueStore;

/// Score at or above which a proxy counts as healthy in overall stats.
const HEALTHY_SCORE: f64 = 0.5;

/// Circuit-breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    /// Consecutive failures that put a proxy into cooldown.
    pub failure_threshold: u32,
    /// How long a cooled-down proxy is pushed to the back of the order.
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Stats report row for one proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    pub enabled: bool,
    pub local: bool,
    pub in_cooldown: bool,
    pub stats: ProxyStats,
}

/// Aggregate over every registered proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallStats {
    pub total_proxies: usize,
    pub enabled_proxies: usize,
    /// Proxies with `health_score >= 0.5`.
    pub healthy_proxies: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Mean of per-proxy averages, over proxies with at least one success.
    pub avg_response_time_ms: f64,
    /// First candidate `select_order` would return right now.
    pub best_proxy: Option<String>,
}

/// Chooses proxies for each request and records how they did.
///
/// The manager only records outcomes. Whether a feed source is given up on
/// is the loader's call.
pub struct ProxyManager {
    registry: ProxyRegistry,
    policy: HealthPolicy,
    prefer_local: AtomicBool,
}

impl ProxyManager {
    pub fn new(proxies: Vec<ProxyDescriptor>, policy: HealthPolicy) -> Self {
        Self {
            registry: ProxyRegistry::new(proxies),
            policy,
            prefer_local: AtomicBool::new(false),
        }
    }

    /// Persist enabled flags, stats and the API key through `store`.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.registry = self.registry.with_store(store);
        self
    }

    /// Registers the same-origin proxy. It is only offered while
    /// [`set_prefer_local`](Self::set_prefer_local) is on.
    pub fn with_local_proxy(self, descriptor: ProxyDescriptor) -> Self {
        let name = descriptor.name.clone();
        if !self.registry.register(descriptor.local()) {
            tracing::warn!(proxy = %name, "Local proxy name collides with a configured proxy");
        }
        self
    }

    pub fn set_prefer_local(&self, prefer: bool) {
        self.prefer_local.store(prefer, Ordering::Relaxed);
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    /// Candidates for fetching `target_url`, best first.
    ///
    /// Disabled proxies are never returned. The local proxy is included (and
    /// placed first) only when "prefer local" is on. Proxies in cooldown go
    /// to the back regardless of score; otherwise the order is health score
    /// descending, then average response time ascending, then registration
    /// order.
    pub fn select_order(&self, target_url: &str) -> Vec<ProxyDescriptor> {
        let prefer_local = self.prefer_local.load(Ordering::Relaxed);
        let now = Instant::now();

        let records = self.registry.lock_records();
        let mut candidates: Vec<(&ProxyRecord, bool, f64, f64)> = records
            .iter()
            .filter(|r| r.descriptor.enabled)
            .filter(|r| prefer_local || !r.descriptor.local)
            .map(|r| {
                let stats = r.stats_or_default();
                (r, r.in_cooldown(now), stats.health_score, stats.avg_response_time_ms)
            })
            .collect();

        // Stable sort keeps registration order for full ties
        candidates.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| b.0.descriptor.local.cmp(&a.0.descriptor.local))
                .then_with(|| b.2.total_cmp(&a.2))
                .then_with(|| a.3.partial_cmp(&b.3).unwrap_or(CmpOrdering::Equal))
        });

        let order: Vec<ProxyDescriptor> = candidates
            .into_iter()
            .map(|(r, ..)| r.descriptor.clone())
            .collect();

        tracing::trace!(
            url = %target_url,
            candidates = order.len(),
            first = order.first().map(|p| p.name.as_str()).unwrap_or("-"),
            "Proxy order selected"
        );
        order
    }

    /// Proxied URL for `target` through `proxy`, with the API key substituted.
    pub fn proxied_url(&self, proxy: &ProxyDescriptor, target: &str) -> String {
        self.registry.wrap(proxy, target)
    }

    pub fn record_success(&self, proxy_name: &str, elapsed: Duration) {
        let now = Utc::now();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let updated = self.registry.update(proxy_name, |record| {
            let stats = record.stats.get_or_insert_with(ProxyStats::default);
            stats.record_success(elapsed_ms, now);
            record.cooldown = None;
            stats.health_score
        });

        match updated {
            Some(score) => tracing::debug!(
                proxy = %proxy_name,
                elapsed_ms = elapsed_ms as u64,
                score = score,
                "Proxy attempt succeeded"
            ),
            None => tracing::warn!(proxy = %proxy_name, "Success recorded for unknown proxy"),
        }
    }

    pub fn record_failure(&self, proxy_name: &str) {
        let now = Utc::now();
        let policy = self.policy;
        let updated = self.registry.update(proxy_name, |record| {
            let stats = record.stats.get_or_insert_with(ProxyStats::default);
            stats.record_failure(now);
            let tripped = stats.consecutive_failures >= policy.failure_threshold;
            if tripped {
                record.cooldown = Some(Cooldown {
                    started: Instant::now(),
                    length: policy.cooldown,
                });
            }
            (stats.consecutive_failures, stats.health_score, tripped)
        });

        match updated {
            Some((streak, score, true)) => tracing::info!(
                proxy = %proxy_name,
                consecutive_failures = streak,
                cooldown_secs = policy.cooldown.as_secs(),
                score = score,
                "Proxy entered cooldown"
            ),
            Some((streak, score, false)) => tracing::debug!(
                proxy = %proxy_name,
                consecutive_failures = streak,
                score = score,
                "Proxy attempt failed"
            ),
            None => tracing::warn!(proxy = %proxy_name, "Failure recorded for unknown proxy"),
        }
    }

    /// Re-enables a proxy and persists the flag.
    pub async fn enable(&self, name: &str) -> Result<(), ProxyError> {
        self.set_enabled(name, true).await
    }

    /// Disables a proxy and persists the flag. Attempts already dispatched
    /// through it run to completion and are still recorded.
    pub async fn disable(&self, name: &str) -> Result<(), ProxyError> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ProxyError> {
        self.registry
            .update(name, |record| record.descriptor.enabled = enabled)
            .ok_or_else(|| ProxyError::UnknownProxy(name.to_owned()))?;
        tracing::info!(proxy = %name, enabled = enabled, "Proxy toggled");
        self.registry.persist_enabled(name, enabled).await
    }

    /// Explicit admin reset of one proxy's stats (or all when `name` is `None`).
    pub async fn reset_stats(&self, name: Option<&str>) -> Result<(), ProxyError> {
        match name {
            Some(name) => {
                self.registry
                    .update(name, |record| {
                        record.stats = None;
                        record.cooldown = None;
                    })
                    .ok_or_else(|| ProxyError::UnknownProxy(name.to_owned()))?;
            }
            None => {
                for record in self.registry.lock_records().iter_mut() {
                    record.stats = None;
                    record.cooldown = None;
                }
            }
        }
        tracing::info!(proxy = name.unwrap_or("*"), "Proxy stats reset");
        self.registry.persist_stats().await
    }

    /// Stores (or clears, with `None`) the premium API key.
    pub async fn set_api_key(&self, key: Option<String>) -> Result<(), ProxyError> {
        let key = key.filter(|k| !k.trim().is_empty());
        self.registry.persist_api_key(key.as_deref()).await?;
        self.registry.set_api_key_in_memory(key.map(SecretString::from));
        Ok(())
    }

    /// Restore persisted state. Call once at startup.
    pub async fn load(&self) -> Result<(), ProxyError> {
        self.registry.load().await
    }

    /// Persist the current stats snapshot.
    pub async fn persist(&self) -> Result<(), ProxyError> {
        self.registry.persist_stats().await
    }

    pub fn get_stats(&self) -> Vec<ProxyStatus> {
        let now = Instant::now();
        self.registry
            .lock_records()
            .iter()
            .map(|r| ProxyStatus {
                name: r.descriptor.name.clone(),
                enabled: r.descriptor.enabled,
                local: r.descriptor.local,
                in_cooldown: r.in_cooldown(now),
                stats: r.stats_or_default(),
            })
            .collect()
    }

    pub fn get_overall_stats(&self) -> OverallStats {
        let statuses = self.get_stats();

        let timed: Vec<f64> = statuses
            .iter()
            .filter(|s| s.stats.success > 0)
            .map(|s| s.stats.avg_response_time_ms)
            .collect();
        let avg_response_time_ms = if timed.is_empty() {
            0.0
        } else {
            timed.iter().sum::<f64>() / timed.len() as f64
        };

        OverallStats {
            total_proxies: statuses.len(),
            enabled_proxies: statuses.iter().filter(|s| s.enabled).count(),
            healthy_proxies: statuses
                .iter()
                .filter(|s| s.stats.health_score >= HEALTHY_SCORE)
                .count(),
            total_requests: statuses.iter().map(|s| s.stats.total_requests).sum(),
            total_successes: statuses.iter().map(|s| s.stats.success).sum(),
            total_failures: statuses.iter().map(|s| s.stats.failures).sum(),
            avg_response_time_ms,
            best_proxy: self.select_order("").first().map(|p| p.name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;

    fn manager() -> ProxyManager {
        ProxyManager::new(
            vec![
                ProxyDescriptor::new("a", "https://a.example/?{url}"),
                ProxyDescriptor::new("b", "https://b.example/?{url}"),
                ProxyDescriptor::new("c", "https://c.example/?{url}"),
            ],
            HealthPolicy::default(),
        )
    }

    fn names(order: &[ProxyDescriptor]) -> Vec<&str> {
        order.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_untried_proxies_keep_registration_order() {
        let m = manager();
        assert_eq!(names(&m.select_order("https://x/")), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_higher_score_first() {
        let m = manager();
        m.record_success("c", Duration::from_millis(100));
        m.record_failure("a");
        // Untried proxies are scored optimistically
        assert_eq!(names(&m.select_order("https://x/")), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_tie_broken_by_response_time() {
        let m = ProxyManager::new(
            vec![
                ProxyDescriptor::new("slow", "direct"),
                ProxyDescriptor::new("fast", "direct"),
            ],
            HealthPolicy::default(),
        );
        m.record_success("slow", Duration::from_millis(2000));
        m.record_success("fast", Duration::from_millis(100));
        // Long failure streaks clamp both scores to zero and cool both down
        for _ in 0..10 {
            m.record_failure("slow");
            m.record_failure("fast");
        }
        assert_eq!(names(&m.select_order("")), vec!["fast", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_moves_proxy_last_until_elapsed() {
        let m = manager();
        for _ in 0..50 {
            m.record_success("a", Duration::from_millis(50));
        }
        for _ in 0..3 {
            m.record_failure("a");
        }
        let order = m.select_order("https://x/");
        assert_eq!(order.last().unwrap().name, "a");
        assert_ne!(order[0].name, "a");

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_ne!(m.select_order("https://x/")[0].name, "a");

        tokio::time::advance(Duration::from_secs(2)).await;
        let status = m.get_stats().into_iter().find(|s| s.name == "a").unwrap();
        assert!(!status.in_cooldown);
    }

    #[test]
    fn test_success_clears_cooldown() {
        let m = manager();
        for _ in 0..3 {
            m.record_failure("b");
        }
        assert!(m.get_stats().iter().any(|s| s.name == "b" && s.in_cooldown));
        m.record_success("b", Duration::from_millis(10));
        assert!(m.get_stats().iter().all(|s| !s.in_cooldown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_cooldown_lasts_until_success() {
        let m = ProxyManager::new(
            vec![
                ProxyDescriptor::new("a", "direct"),
                ProxyDescriptor::new("b", "direct"),
            ],
            HealthPolicy {
                failure_threshold: 1,
                cooldown: Duration::from_secs(u64::MAX),
            },
        );
        m.record_failure("a");
        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;

        assert_eq!(names(&m.select_order("https://x/")), vec!["b", "a"]);
        m.record_success("a", Duration::from_millis(10));
        assert!(m.get_stats().iter().all(|s| !s.in_cooldown));
    }

    #[tokio::test]
    async fn test_disabled_never_selected() {
        let m = manager();
        m.disable("b").await.unwrap();
        assert_eq!(names(&m.select_order("https://x/")), vec!["a", "c"]);

        m.enable("b").await.unwrap();
        assert_eq!(m.select_order("https://x/").len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_proxy_toggle_errors() {
        let m = manager();
        assert!(matches!(
            m.disable("nope").await,
            Err(ProxyError::UnknownProxy(_))
        ));
    }

    #[test]
    fn test_local_proxy_only_when_preferred() {
        let m = manager().with_local_proxy(ProxyDescriptor::new("local", "/api/proxy?url={url}"));
        assert!(!names(&m.select_order("")).contains(&"local"));

        m.set_prefer_local(true);
        m.record_success("a", Duration::ZERO);
        assert_eq!(m.select_order("")[0].name, "local");
    }

    #[test]
    fn test_unknown_proxy_record_is_ignored() {
        let m = manager();
        m.record_failure("ghost");
        m.record_success("ghost", Duration::from_millis(1));
        assert_eq!(m.get_overall_stats().total_requests, 0);
    }

    #[test]
    fn test_overall_stats() {
        let m = manager();
        m.record_success("a", Duration::from_millis(100));
        m.record_success("b", Duration::from_millis(300));
        for _ in 0..6 {
            m.record_failure("c");
        }

        let overall = m.get_overall_stats();
        assert_eq!(overall.total_proxies, 3);
        assert_eq!(overall.enabled_proxies, 3);
        assert_eq!(overall.total_requests, 8);
        assert_eq!(overall.total_successes, 2);
        assert_eq!(overall.total_failures, 6);
        assert!((overall.avg_response_time_ms - 200.0).abs() < 1e-6);
        assert_eq!(overall.healthy_proxies, 2);
        assert_eq!(overall.best_proxy.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_reset_stats_persists() {
        let store = Arc::new(MemoryStore::new());
        let m = manager().with_store(store.clone());
        m.record_failure("a");
        m.record_failure("b");
        m.persist().await.unwrap();

        m.reset_stats(Some("a")).await.unwrap();
        let stats = m.get_stats();
        assert_eq!(stats[0].stats.total_requests, 0);
        assert_eq!(stats[1].stats.total_requests, 1);

        m.reset_stats(None).await.unwrap();
        assert_eq!(m.get_overall_stats().total_requests, 0);
        assert_eq!(
            store.get_string("proxy.stats").await.unwrap().as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn test_api_key_cleared_by_blank() {
        let store = Arc::new(MemoryStore::new());
        let m = manager().with_store(store.clone());
        m.set_api_key(Some("abc".into())).await.unwrap();
        assert!(m.registry().has_api_key());

        m.set_api_key(Some("  ".into())).await.unwrap();
        assert!(!m.registry().has_api_key());
        assert_eq!(
            store.get_string("proxy.api_key").await.unwrap().as_deref(),
            Some("")
        );
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_for_any_outcome_sequence(
            ops in proptest::collection::vec((0usize..3, any::<bool>(), 0u64..5000), 0..100),
            disabled in proptest::collection::vec(any::<bool>(), 3),
        ) {
            let m = manager();
            for (name, flag) in ["a", "b", "c"].iter().zip(&disabled) {
                if *flag {
                    m.registry().update(name, |r| r.descriptor.enabled = false);
                }
            }
            for (idx, ok, ms) in ops {
                let name = ["a", "b", "c"][idx];
                if ok {
                    m.record_success(name, Duration::from_millis(ms));
                } else {
                    m.record_failure(name);
                }
            }

            for status in m.get_stats() {
                prop_assert_eq!(status.stats.total_requests, status.stats.success + status.stats.failures);
            }
            let order = m.select_order("https://x/");
            for proxy in &order {
                prop_assert!(proxy.enabled);
            }
            prop_assert_eq!(order.len(), disabled.iter().filter(|d| !**d).count());
        }
    }
}
