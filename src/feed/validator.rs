//! One-off feed checks for the subscribe flow: "is this URL a feed?" and
//! "which feeds does this page advertise?". Both answers are memoized in the
//! shared [`ValidationCache`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::discovery::find_feed_links;
use super::fetcher::{FetchError, NetworkFetcher};
use super::parser::SecureParser;
use crate::cache::{TtlClass, ValidationCache};
use crate::proxy::ProxyManager;
use crate::util::validate_url;

pub const VALIDATE_CACHE_PREFIX: &str = "validate:";
pub const DISCOVERY_CACHE_PREFIX: &str = "discovery:";

/// Outcome of [`FeedValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub url: String,
    pub valid: bool,
    pub title: Option<String>,
    pub item_count: usize,
    pub error: Option<String>,
}

impl ValidationResult {
    fn invalid(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            valid: false,
            title: None,
            item_count: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No feeds found at {0}")]
    NotAFeed(String),

    #[error("Failed to fetch page: {0}")]
    Fetch(String),
}

/// Validates feed URLs and discovers feeds on HTML pages through the proxy
/// chain.
pub struct FeedValidator {
    proxies: Arc<ProxyManager>,
    fetcher: Arc<dyn NetworkFetcher>,
    parser: Arc<dyn SecureParser>,
    cache: Option<Arc<ValidationCache>>,
    attempt_timeout: Duration,
}

impl FeedValidator {
    pub fn new(
        proxies: Arc<ProxyManager>,
        fetcher: Arc<dyn NetworkFetcher>,
        parser: Arc<dyn SecureParser>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            proxies,
            fetcher,
            parser,
            cache: None,
            attempt_timeout,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ValidationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Fetches `url` and runs it through the secure parser.
    ///
    /// Never fails: problems are reported in [`ValidationResult::error`].
    /// Unsafe URLs are rejected before any network call and are not cached.
    pub async fn validate(&self, url: &str) -> ValidationResult {
        if let Err(e) = validate_url(url) {
            return ValidationResult::invalid(url, e.to_string());
        }

        let key = format!("{VALIDATE_CACHE_PREFIX}{url}");
        if let Some(cached) = self.cached::<ValidationResult>(&key) {
            tracing::debug!(url = %url, valid = cached.valid, "Validation served from cache");
            return cached;
        }

        let parse = |body: &str| self.parser.parse(body, url).map_err(|e| e.to_string());
        let result = match self.fetch_through_proxies(url, parse).await {
            Ok(parsed) => ValidationResult {
                url: url.to_string(),
                valid: true,
                title: parsed.title,
                item_count: parsed.items.len(),
                error: None,
            },
            Err(reason) => ValidationResult::invalid(url, reason),
        };

        let class = if result.valid {
            TtlClass::Success
        } else {
            TtlClass::Failure
        };
        self.store(&key, &result, class);
        tracing::info!(url = %url, valid = result.valid, "Feed validated");
        result
    }

    /// Candidate feed URLs for `page_url`.
    ///
    /// A page that is itself a feed yields just its own URL. Otherwise the
    /// HTML is scanned for alternate RSS/Atom links, relative hrefs resolved
    /// and unsafe targets dropped.
    pub async fn discover(&self, page_url: &str) -> Result<Vec<String>, DiscoveryError> {
        validate_url(page_url).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;

        let key = format!("{DISCOVERY_CACHE_PREFIX}{page_url}");
        if let Some(cached) = self.cached::<Vec<String>>(&key) {
            tracing::debug!(url = %page_url, "Discovery served from cache");
            return Ok(cached);
        }

        let body = self
            .fetch_through_proxies(page_url, |body| Ok(body.to_string()))
            .await
            .map_err(DiscoveryError::Fetch)?;

        let feeds = if self.parser.parse(&body, page_url).is_ok() {
            vec![page_url.to_string()]
        } else {
            find_feed_links(&body, page_url)
                .into_iter()
                .filter(|link| match validate_url(link) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(url = %link, error = %e, "Discovered feed rejected");
                        false
                    }
                })
                .collect()
        };

        if feeds.is_empty() {
            return Err(DiscoveryError::NotAFeed(page_url.to_string()));
        }

        // Default class picks the discovery TTL from the key prefix
        self.store(&key, &feeds, TtlClass::Default);
        tracing::info!(url = %page_url, found = feeds.len(), "Feed discovery finished");
        Ok(feeds)
    }

    /// Walks the proxy order until a response passes `accept`.
    ///
    /// Every attempt is recorded against its proxy. Returns the last failure
    /// reason when all candidates fail.
    async fn fetch_through_proxies<T>(
        &self,
        url: &str,
        accept: impl Fn(&str) -> Result<T, String>,
    ) -> Result<T, String> {
        let candidates = self.proxies.select_order(url);
        if candidates.is_empty() {
            return Err("No enabled proxies".to_string());
        }

        let mut last_reason = String::new();
        for proxy in &candidates {
            let proxied = self.proxies.proxied_url(proxy, url);
            let started = Instant::now();

            let outcome = match self.fetcher.fetch(&proxied, self.attempt_timeout).await {
                Ok(response) if !response.is_success() => {
                    Err(FetchError::HttpStatus(response.status).to_string())
                }
                Ok(response) => accept(&response.body),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(value) => {
                    self.proxies.record_success(&proxy.name, started.elapsed());
                    return Ok(value);
                }
                Err(reason) => {
                    self.proxies.record_failure(&proxy.name);
                    tracing::debug!(
                        url = %url,
                        proxy = %proxy.name,
                        error = %reason,
                        "Proxy attempt failed"
                    );
                    last_reason = reason;
                }
            }
        }

        Err(last_reason)
    }

    fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cache.as_ref()?.get_json(key)
    }

    fn store<T: Serialize>(&self, key: &str, value: &T, class: TtlClass) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.set_json(key, value, class) {
            tracing::warn!(key = %key, error = %e, "Result not cached");
        }
    }
}
