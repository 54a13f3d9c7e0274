//! Integration tests for the validation cache through its public API:
//! expiry, LRU eviction under both budgets, bulk invalidation and stats.

use serde_json::json;
use std::time::Duration;

use feedmux::cache::{CacheConfig, CacheConfigUpdate, TtlClass, ValidationCache};

fn config(max_entries: usize) -> CacheConfig {
    CacheConfig {
        max_entries,
        cleanup_interval: Duration::ZERO,
        ..CacheConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_entry_expires_after_ttl() {
    let cache = ValidationCache::new(config(10));
    cache
        .set("k", json!("v"), TtlClass::Custom(Duration::from_millis(50)))
        .unwrap();

    tokio::time::advance(Duration::from_millis(40)).await;
    assert_eq!(cache.get("k").map(|e| e.data), Some(json!("v")));

    tokio::time::advance(Duration::from_millis(60)).await;
    assert!(cache.get("k").is_none());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_max_entries_evicts_least_recently_used() {
    let cache = ValidationCache::new(config(3));
    for key in ["a", "b", "c"] {
        cache.set(key, json!(key), TtlClass::Success).unwrap();
    }
    // Touch "a" so "b" becomes the oldest by access
    cache.get("a");

    cache.set("d", json!("d"), TtlClass::Success).unwrap();

    assert_eq!(cache.len(), 3);
    assert!(cache.has("a"));
    assert!(!cache.has("b"));
    assert!(cache.has("c"));
    assert!(cache.has("d"));
}

#[tokio::test]
async fn test_size_budget_holds_after_every_set() {
    let cache = ValidationCache::new(CacheConfig {
        max_size_bytes: 512,
        ..config(1000)
    });
    for i in 0..50 {
        cache
            .set(&format!("key:{i}"), json!("x".repeat(40)), TtlClass::Default)
            .unwrap();
        assert!(cache.get_stats().total_size_bytes <= 512);
    }
    assert!(cache.has("key:49"));
    assert!(!cache.has("key:0"));
}

#[tokio::test]
async fn test_invalidate_pattern_removes_matching_keys() {
    let cache = ValidationCache::new(config(10));
    for key in ["user:1", "user:2", "admin:1"] {
        cache.set(key, json!(true), TtlClass::Success).unwrap();
    }

    assert_eq!(cache.invalidate_pattern("user:*"), 2);
    assert!(!cache.has("user:1"));
    assert!(!cache.has("user:2"));
    assert!(cache.has("admin:1"));
}

#[tokio::test]
async fn test_discovery_prefix_selects_discovery_ttl() {
    let cache = ValidationCache::new(config(10));
    cache
        .set("discovery:https://example.com", json!(["https://example.com/rss"]), TtlClass::Default)
        .unwrap();
    cache
        .set("validate:https://example.com/rss", json!({"valid": false}), TtlClass::Failure)
        .unwrap();

    let stats = cache.get_stats();
    assert_eq!(stats.ttl_distribution.discovery, 1);
    assert_eq!(stats.ttl_distribution.failure, 1);
    assert_eq!(
        cache.get("discovery:https://example.com").map(|e| e.ttl),
        Some(CacheConfig::default().discovery_ttl)
    );
}

#[tokio::test(start_paused = true)]
async fn test_configure_only_affects_new_entries() {
    let cache = ValidationCache::new(config(10));
    cache.set("old", json!(1), TtlClass::Success).unwrap();

    cache.configure(CacheConfigUpdate {
        success_ttl: Some(Duration::from_secs(1)),
        ..CacheConfigUpdate::default()
    });
    cache.set("new", json!(2), TtlClass::Success).unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.has("old"));
    assert!(!cache.has("new"));
}

#[tokio::test(start_paused = true)]
async fn test_background_cleanup_until_destroyed() {
    let cache = ValidationCache::new(CacheConfig {
        cleanup_interval: Duration::from_secs(1),
        ..CacheConfig::default()
    });
    cache
        .set("short", json!(1), TtlClass::Custom(Duration::from_millis(100)))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.get_stats().total_entries, 0);

    cache.destroy();
    cache.destroy();
    assert!(cache.set("late", json!(1), TtlClass::Success).is_err());
}

#[tokio::test]
async fn test_hit_rate_rounded_to_two_decimals() {
    let cache = ValidationCache::new(config(10));
    cache.set("k", json!(1), TtlClass::Success).unwrap();
    cache.get("k");
    cache.get("k");
    cache.get("missing");

    let stats = cache.get_stats();
    assert_eq!(stats.hit_count, 2);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.hit_rate, 66.67);
}
