//! Progressive, cancellable loading of every feed source through the proxy
//! chain.
//!
//! A load cycle fans sources out over a bounded worker pool, priority group
//! first. Each settled source is merged and published at once, so observers
//! see articles long before the slowest source resolves.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::fetcher::{FetchError, NetworkFetcher};
use super::parser::SecureParser;
use super::state::{percent, FeedLoadingState, LoadStatus, SourceFailure};
use super::types::{Article, FeedSource, ParsedFeed};
use crate::cache::{TtlClass, ValidationCache};
use crate::proxy::ProxyManager;

/// Cache key prefix for per-source parsed feeds.
pub const FEED_CACHE_PREFIX: &str = "feed:";

/// Why a source contributed no articles in a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("All {attempts} proxy attempts failed; last error: {last_reason}")]
    Exhausted { attempts: usize, last_reason: String },

    #[error("No enabled proxies")]
    NoProxies,

    #[error("Loading cancelled")]
    Cancelled,
}

/// Worker pool and per-attempt limits.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Sources fetched at once.
    pub concurrency: usize,
    /// Deadline for one proxy attempt, body included.
    pub attempt_timeout: Duration,
    /// Pause before trying the next proxy for the same source.
    pub retry_delay: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            attempt_timeout: Duration::from_secs(15),
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Mutable bookkeeping shared by the cycle and the public controls.
struct Session {
    running: bool,
    /// A cancel that arrived before the next cycle registered itself.
    cancel_requested: bool,
    /// Bumped by every new cycle; results tagged with an older one are dropped.
    generation: u64,
    token: CancellationToken,
    total: usize,
    settled: usize,
    progress: u8,
    /// Sources dispatched in this cycle that have not settled.
    pending: Vec<FeedSource>,
    /// Sources that succeeded since the last full load.
    succeeded: usize,
    failed: Vec<FeedSource>,
    errors: Vec<SourceFailure>,
    articles: Arc<Vec<Article>>,
    seen: HashSet<String>,
}

impl Session {
    fn snapshot(&self, status: LoadStatus, current_action: String) -> FeedLoadingState {
        FeedLoadingState {
            status,
            progress: self.progress,
            current_action,
            is_resolved: status.is_terminal(),
            errors: self.errors.clone(),
        }
    }
}

/// Orchestrates concurrent loading of all feed sources.
///
/// Built once and shared behind an `Arc`. Observers either poll
/// [`state`](Self::state)/[`articles`](Self::articles) or hold the receivers
/// from [`subscribe`](Self::subscribe) and
/// [`subscribe_articles`](Self::subscribe_articles).
///
/// None of the load methods return errors. Per-source failures end up in
/// [`FeedLoadingState::errors`].
pub struct ProgressiveFeedLoader {
    proxies: Arc<ProxyManager>,
    fetcher: Arc<dyn NetworkFetcher>,
    parser: Arc<dyn SecureParser>,
    cache: Option<Arc<ValidationCache>>,
    config: LoaderConfig,
    sources: Mutex<Vec<FeedSource>>,
    session: Mutex<Session>,
    state_tx: watch::Sender<FeedLoadingState>,
    articles_tx: watch::Sender<Arc<Vec<Article>>>,
}

impl ProgressiveFeedLoader {
    pub fn new(
        proxies: Arc<ProxyManager>,
        fetcher: Arc<dyn NetworkFetcher>,
        parser: Arc<dyn SecureParser>,
        config: LoaderConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(FeedLoadingState::default());
        let (articles_tx, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            proxies,
            fetcher,
            parser,
            cache: None,
            config: LoaderConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
            sources: Mutex::new(Vec::new()),
            session: Mutex::new(Session {
                running: false,
                cancel_requested: false,
                generation: 0,
                token: CancellationToken::new(),
                total: 0,
                settled: 0,
                progress: 0,
                pending: Vec::new(),
                succeeded: 0,
                failed: Vec::new(),
                errors: Vec::new(),
                articles: Arc::new(Vec::new()),
                seen: HashSet::new(),
            }),
            state_tx,
            articles_tx,
        }
    }

    /// Serve and store per-source results through `cache`.
    pub fn with_cache(mut self, cache: Arc<ValidationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the feed list used by subsequent cycles.
    pub fn set_sources(&self, sources: Vec<FeedSource>) {
        *self.sources.lock().unwrap_or_else(PoisonError::into_inner) = sources;
    }

    pub fn sources(&self) -> Vec<FeedSource> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedLoadingState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_articles(&self) -> watch::Receiver<Arc<Vec<Article>>> {
        self.articles_tx.subscribe()
    }

    pub fn state(&self) -> FeedLoadingState {
        self.state_tx.borrow().clone()
    }

    pub fn articles(&self) -> Arc<Vec<Article>> {
        self.articles_tx.borrow().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Public controls
    // ========================================================================

    /// Loads every active source, the `priority_category` group first.
    ///
    /// `None` or `"all"` puts every source not hidden from the "all" view in
    /// the priority group. A call made while a cycle is running does nothing.
    /// Without `force_refresh`, sources with a live cache entry are served
    /// from it.
    pub async fn load_feeds(&self, force_refresh: bool, priority_category: Option<&str>) {
        let sources = self.active_sources();
        let Some((generation, token)) = self.begin_cycle(&sources, false, true) else {
            tracing::debug!("Load already in progress, ignoring request");
            return;
        };
        self.run_cycle(generation, token, sources, force_refresh, priority_category)
            .await;
    }

    /// Cancels any running cycle and reloads everything, bypassing the cache.
    pub async fn refresh_feeds(&self, priority_category: Option<&str>) {
        let sources = self.active_sources();
        let Some((generation, token)) = self.begin_cycle(&sources, true, true) else {
            return;
        };
        self.run_cycle(generation, token, sources, true, priority_category)
            .await;
    }

    /// Re-runs only the sources that failed, keeping loaded articles.
    pub async fn retry_failed_feeds(&self) {
        let failed = self.lock().failed.clone();
        if failed.is_empty() {
            tracing::debug!("No failed feeds to retry");
            return;
        }
        let Some((generation, token)) = self.begin_cycle(&failed, false, false) else {
            tracing::debug!("Load in progress, retry ignored");
            return;
        };
        tracing::info!(sources = failed.len(), "Retrying failed feeds");
        self.run_cycle(generation, token, failed, true, None).await;
    }

    /// Stops the running cycle at the next checkpoint and resolves it now.
    ///
    /// Sources that had not settled are recorded as cancelled failures so a
    /// later [`retry_failed_feeds`](Self::retry_failed_feeds) picks them up.
    /// Results that arrive afterwards are discarded.
    ///
    /// A cancel issued while no cycle is registered (for example right after
    /// spawning `load_feeds` on another task) is held and cancels the next
    /// `load_feeds` or `retry_failed_feeds` cycle as soon as it starts.
    /// `refresh_feeds` clears it.
    pub fn cancel_loading(&self) {
        let mut s = self.lock();
        if !s.running {
            s.cancel_requested = true;
            tracing::debug!("No load running, cancel held for the next cycle");
            return;
        }
        s.token.cancel();
        s.running = false;

        let reason = SourceError::Cancelled.to_string();
        let cancelled: Vec<FeedSource> = s.pending.drain(..).collect();
        for source in &cancelled {
            s.errors.push(SourceFailure {
                url: source.url.clone(),
                reason: reason.clone(),
            });
        }
        s.failed.extend(cancelled);

        let status = if s.succeeded > 0 {
            LoadStatus::Partial
        } else {
            LoadStatus::Error
        };
        let action = format!("Cancelled after {} of {} sources", s.settled, s.total);
        tracing::info!(settled = s.settled, total = s.total, "Feed loading cancelled");
        self.state_tx.send_replace(s.snapshot(status, action));
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    fn active_sources(&self) -> Vec<FeedSource> {
        let mut seen = HashSet::new();
        self.sources()
            .into_iter()
            .filter(|s| s.active)
            .filter(|s| {
                let fresh = seen.insert(s.url.clone());
                if !fresh {
                    tracing::debug!(url = %s.url, "Duplicate feed source skipped");
                }
                fresh
            })
            .collect()
    }

    /// Starts a cycle over `sources`. Returns `None` if one is running and
    /// `reenter` is false; otherwise supersedes it.
    fn begin_cycle(
        &self,
        sources: &[FeedSource],
        reenter: bool,
        reset: bool,
    ) -> Option<(u64, CancellationToken)> {
        let mut s = self.lock();
        if s.running {
            if !reenter {
                return None;
            }
            s.token.cancel();
            tracing::debug!(generation = s.generation, "Superseding running load");
        }
        let cancel_now = std::mem::take(&mut s.cancel_requested) && !reenter;

        s.running = true;
        s.generation += 1;
        s.token = CancellationToken::new();
        s.total = sources.len();
        s.settled = 0;
        s.progress = 0;
        s.pending = sources.to_vec();
        s.errors.clear();
        s.failed.clear();
        if reset {
            s.succeeded = 0;
            s.articles = Arc::new(Vec::new());
            s.seen.clear();
            self.articles_tx.send_replace(s.articles.clone());
        }

        let action = format!("Fetching {} sources", s.total);
        self.state_tx
            .send_replace(s.snapshot(LoadStatus::Loading, action));
        let started = (s.generation, s.token.clone());
        drop(s);

        if cancel_now {
            self.cancel_loading();
        }
        Some(started)
    }

    async fn run_cycle(
        &self,
        generation: u64,
        token: CancellationToken,
        sources: Vec<FeedSource>,
        force_refresh: bool,
        priority_category: Option<&str>,
    ) {
        let (priority, background): (Vec<FeedSource>, Vec<FeedSource>) = sources
            .into_iter()
            .partition(|s| s.matches_category(priority_category));

        tracing::info!(
            generation = generation,
            priority = priority.len(),
            background = background.len(),
            force = force_refresh,
            "Feed load started"
        );

        self.run_group(generation, &token, priority, force_refresh).await;
        if !token.is_cancelled() {
            self.run_group(generation, &token, background, force_refresh)
                .await;
        }

        self.finish(generation);

        if let Err(e) = self.proxies.persist().await {
            tracing::warn!(error = %e, "Failed to persist proxy stats");
        }
    }

    async fn run_group(
        &self,
        generation: u64,
        token: &CancellationToken,
        group: Vec<FeedSource>,
        force_refresh: bool,
    ) {
        if group.is_empty() {
            return;
        }

        stream::iter(group)
            .map(|source| async move {
                let result = self.load_source(&source, force_refresh, token).await;
                (source, result)
            })
            .buffer_unordered(self.config.concurrency)
            .for_each(|(source, result)| {
                self.settle(generation, source, result);
                futures::future::ready(())
            })
            .await;
    }

    /// Merges one settled source and republishes. Stale results are dropped.
    fn settle(&self, generation: u64, source: FeedSource, result: Result<ParsedFeed, SourceError>) {
        let mut s = self.lock();
        if !s.running || s.generation != generation {
            tracing::debug!(url = %source.url, "Discarding result from a finished load");
            return;
        }
        if matches!(result, Err(SourceError::Cancelled)) {
            return;
        }

        if let Some(pos) = s.pending.iter().position(|p| p.url == source.url) {
            s.pending.swap_remove(pos);
        }
        s.settled += 1;

        match result {
            Ok(parsed) => {
                s.succeeded += 1;
                let feed_title = parsed.title;
                let mut fresh = Vec::with_capacity(parsed.items.len());
                for item in parsed.items {
                    let article = Article::from_item(item, &source, feed_title.as_deref());
                    if s.seen.insert(article.identity()) {
                        fresh.push(article);
                    }
                }
                let added = fresh.len();
                if added > 0 {
                    Arc::make_mut(&mut s.articles).extend(fresh);
                    self.articles_tx.send_replace(s.articles.clone());
                }
                tracing::debug!(url = %source.url, added = added, "Feed source loaded");
            }
            Err(e) => {
                tracing::warn!(url = %source.url, error = %e, "Feed source failed");
                s.errors.push(SourceFailure {
                    url: source.url.clone(),
                    reason: e.to_string(),
                });
                s.failed.push(source);
            }
        }

        s.progress = s.progress.max(percent(s.settled, s.total));
        let action = format!("Loaded {} of {} sources", s.settled, s.total);
        self.state_tx
            .send_replace(s.snapshot(LoadStatus::Loading, action));
    }

    fn finish(&self, generation: u64) {
        let mut s = self.lock();
        if !s.running || s.generation != generation {
            return;
        }
        s.running = false;
        s.progress = 100;

        let status = LoadStatus::from_outcomes(s.succeeded, s.failed.len());
        tracing::info!(
            status = ?status,
            succeeded = s.succeeded,
            failed = s.failed.len(),
            articles = s.articles.len(),
            "Feed load finished"
        );
        let action = format!("Loaded {} articles", s.articles.len());
        self.state_tx.send_replace(s.snapshot(status, action));
    }

    // ========================================================================
    // Per-source fetch
    // ========================================================================

    /// Tries each proxy in health order until one yields a parsed feed.
    async fn load_source(
        &self,
        source: &FeedSource,
        force_refresh: bool,
        token: &CancellationToken,
    ) -> Result<ParsedFeed, SourceError> {
        if token.is_cancelled() {
            return Err(SourceError::Cancelled);
        }

        let cache_key = format!("{FEED_CACHE_PREFIX}{}", source.url);
        if !force_refresh {
            if let Some(cached) = self
                .cache
                .as_ref()
                .and_then(|c| c.get_json::<ParsedFeed>(&cache_key))
            {
                tracing::debug!(url = %source.url, "Feed served from cache");
                return Ok(cached);
            }
        }

        let candidates = self.proxies.select_order(&source.url);
        if candidates.is_empty() {
            return Err(SourceError::NoProxies);
        }

        let mut attempts = 0usize;
        let mut last_reason = String::new();

        for (index, proxy) in candidates.iter().enumerate() {
            if token.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            if index > 0 && !self.config.retry_delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return Err(SourceError::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            attempts += 1;
            let url = self.proxies.proxied_url(proxy, &source.url);
            let started = Instant::now();

            let attempt = tokio::time::timeout(
                self.config.attempt_timeout,
                self.fetcher.fetch(&url, self.config.attempt_timeout),
            );
            let fetched = attempt.await.unwrap_or(Err(FetchError::Timeout));

            let outcome = match fetched {
                Ok(response) if !response.is_success() => {
                    Err(FetchError::HttpStatus(response.status).to_string())
                }
                Ok(response) => self
                    .parser
                    .parse(&response.body, &source.url)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(parsed) => {
                    self.proxies.record_success(&proxy.name, started.elapsed());
                    if token.is_cancelled() {
                        return Err(SourceError::Cancelled);
                    }
                    self.store_in_cache(&cache_key, &parsed);
                    return Ok(parsed);
                }
                Err(reason) => {
                    self.proxies.record_failure(&proxy.name);
                    tracing::debug!(
                        url = %source.url,
                        proxy = %proxy.name,
                        attempt = attempts,
                        error = %reason,
                        "Proxy attempt failed"
                    );
                    last_reason = reason;
                }
            }
        }

        Err(SourceError::Exhausted {
            attempts,
            last_reason,
        })
    }

    fn store_in_cache(&self, key: &str, parsed: &ParsedFeed) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.set_json(key, parsed, TtlClass::Success) {
            tracing::warn!(key = %key, error = %e, "Feed not cached");
        }
    }
}
