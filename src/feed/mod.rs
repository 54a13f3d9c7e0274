//! Feed sources, fetching, parsing and progressive loading.
//!
//! - [`types`] - feed sources, parsed items and merged articles
//! - [`fetcher`] - the [`NetworkFetcher`] seam and its `reqwest` implementation
//! - [`parser`] - the [`SecureParser`] seam and its `feed-rs` implementation
//! - [`opml`] - reading subscription lists into [`FeedSource`]s
//! - [`loader`] - the [`ProgressiveFeedLoader`] orchestrating a load cycle
//! - [`validator`] - single-feed validation and HTML feed discovery
//!
//! # Example
//!
//! ```ignore
//! let loader = ProgressiveFeedLoader::new(proxies, fetcher, parser, LoaderConfig::default())
//!     .with_cache(cache);
//! loader.set_sources(parse_sources("feeds.opml").await?);
//! let mut state = loader.subscribe();
//! loader.load_feeds(false, Some("tech")).await;
//! ```

mod discovery;
pub mod fetcher;
pub mod loader;
pub mod opml;
pub mod parser;
pub mod state;
pub mod types;
pub mod validator;

pub use discovery::find_feed_links;
pub use fetcher::{FetchError, FetchResponse, HttpFetcher, NetworkFetcher, DEFAULT_MAX_RESPONSE_BYTES};
pub use loader::{LoaderConfig, ProgressiveFeedLoader, SourceError, FEED_CACHE_PREFIX};
pub use opml::{parse_sources, OpmlError};
pub use parser::{FeedRsParser, ParseError, SecureParser};
pub use state::{FeedLoadingState, LoadStatus, SourceFailure};
pub use types::{Article, FeedItem, FeedSource, ParsedFeed, ALL_CATEGORY};
pub use validator::{
    DiscoveryError, FeedValidator, ValidationResult, DISCOVERY_CACHE_PREFIX, VALIDATE_CACHE_PREFIX,
};
