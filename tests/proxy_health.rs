//! Integration tests for proxy health as seen by the loader: demotion of a
//! failing proxy, disabled proxies, and stats surviving a restart.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedmux::feed::{
    FeedItem, FeedSource, FetchError, FetchResponse, LoadStatus, LoaderConfig, NetworkFetcher,
    ParseError, ParsedFeed, ProgressiveFeedLoader, SecureParser,
};
use feedmux::proxy::{HealthPolicy, ProxyDescriptor, ProxyManager};
use feedmux::storage::{KeyValueStore, MemoryStore};

const FLAKY: &str = "https://flaky.example/?u=";

/// Direct requests succeed; anything through the flaky proxy fails.
#[derive(Default)]
struct RecordingFetcher {
    calls: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    fn calls_through(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl NetworkFetcher for RecordingFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        if url.starts_with(FLAKY) {
            return Err(FetchError::HttpStatus(429));
        }
        Ok(FetchResponse {
            status: 200,
            body: url.to_string(),
        })
    }
}

struct OneItemParser;

impl SecureParser for OneItemParser {
    fn parse(&self, raw: &str, _source_url: &str) -> Result<ParsedFeed, ParseError> {
        Ok(ParsedFeed {
            title: None,
            items: vec![FeedItem {
                id: raw.to_string(),
                title: raw.to_string(),
                link: Some(raw.to_string()),
                published: None,
                summary: None,
            }],
        })
    }
}

fn descriptors() -> Vec<ProxyDescriptor> {
    vec![
        ProxyDescriptor::new("flaky", format!("{FLAKY}{{url}}")),
        ProxyDescriptor::new("direct", "direct"),
    ]
}

fn sources(n: usize) -> Vec<FeedSource> {
    (1..=n)
        .map(|i| FeedSource::new(format!("https://site{i}.example/feed")))
        .collect()
}

fn loader(proxies: Arc<ProxyManager>, fetcher: Arc<RecordingFetcher>) -> ProgressiveFeedLoader {
    ProgressiveFeedLoader::new(
        proxies,
        fetcher,
        Arc::new(OneItemParser),
        LoaderConfig {
            concurrency: 1,
            attempt_timeout: Duration::from_secs(5),
            retry_delay: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn test_failing_proxy_is_demoted_after_first_failure() {
    let proxies = Arc::new(ProxyManager::new(descriptors(), HealthPolicy::default()));
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = loader(proxies.clone(), fetcher.clone());
    loader.set_sources(sources(5));

    loader.load_feeds(false, None).await;

    assert_eq!(loader.state().status, LoadStatus::Success);
    assert_eq!(fetcher.calls_through(FLAKY), 1);

    let overall = proxies.get_overall_stats();
    assert_eq!(overall.total_requests, 6);
    assert_eq!(overall.total_successes, 5);
    assert_eq!(overall.best_proxy.as_deref(), Some("direct"));
}

#[tokio::test]
async fn test_disabled_proxy_is_never_tried() {
    let proxies = Arc::new(ProxyManager::new(descriptors(), HealthPolicy::default()));
    proxies.disable("flaky").await.unwrap();
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = loader(proxies.clone(), fetcher.clone());
    loader.set_sources(sources(3));

    loader.load_feeds(false, None).await;

    assert_eq!(fetcher.calls_through(FLAKY), 0);
    let flaky = proxies
        .get_stats()
        .into_iter()
        .find(|s| s.name == "flaky")
        .unwrap();
    assert!(!flaky.enabled);
    assert_eq!(flaky.stats.total_requests, 0);
}

#[tokio::test]
async fn test_stats_and_flags_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    {
        let proxies = Arc::new(
            ProxyManager::new(descriptors(), HealthPolicy::default()).with_store(store.clone()),
        );
        let loader = loader(proxies.clone(), Arc::new(RecordingFetcher::default()));
        loader.set_sources(sources(2));
        loader.load_feeds(false, None).await;
        proxies.disable("flaky").await.unwrap();
    }
    assert!(store.get_string("proxy.stats").await.unwrap().is_some());

    let restored = ProxyManager::new(descriptors(), HealthPolicy::default()).with_store(store);
    restored.load().await.unwrap();

    let stats = restored.get_stats();
    let flaky = stats.iter().find(|s| s.name == "flaky").unwrap();
    let direct = stats.iter().find(|s| s.name == "direct").unwrap();
    assert!(!flaky.enabled);
    assert_eq!(flaky.stats.failures, 1);
    assert_eq!(direct.stats.success, 2);
    assert_eq!(
        direct.stats.total_requests,
        direct.stats.success + direct.stats.failures
    );
    assert_eq!(names(&restored.select_order("https://site1.example/feed")), ["direct"]);
}

fn names(order: &[ProxyDescriptor]) -> Vec<&str> {
    order.iter().map(|p| p.name.as_str()).collect()
}
