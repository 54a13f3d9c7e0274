//! Progressive feed aggregation through unreliable CORS proxies.
//!
//! The crate is organized leaf to root:
//!
//! - [`proxy`] - proxy registry, per-proxy health statistics and candidate ordering
//! - [`cache`] - TTL/LRU validation cache with pattern invalidation
//! - [`feed`] - feed sources, secure parsing, HTTP fetching and the progressive loader
//! - [`storage`] - key-value persistence for proxy flags and stats
//! - [`config`] - `config.toml` loading
//!
//! A [`proxy::ProxyManager`] and a [`cache::ValidationCache`] are built once at
//! startup and shared by reference with the [`feed::ProgressiveFeedLoader`].

pub mod cache;
pub mod config;
pub mod feed;
pub mod proxy;
pub mod storage;
pub mod util;
