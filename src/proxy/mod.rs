//! Proxy health tracking and candidate selection.
//!
//! Feed hosts rarely send CORS headers, so every fetch goes through an
//! intermediary. Public intermediaries are flaky and rate limited; this module
//! keeps per-proxy statistics and decides, for each request, which proxies to
//! try and in what order.
//!
//! - [`descriptor`] - proxy identity and URL wrapping
//! - [`stats`] - rolling per-proxy statistics and the health score
//! - [`registry`] - the single mutable record per proxy, plus persistence
//! - [`manager`] - selection ordering, cooldowns and the stats report

mod descriptor;
mod manager;
mod registry;
mod stats;

use thiserror::Error;

pub use descriptor::{default_proxies, ProxyDescriptor, DIRECT_TEMPLATE};
pub use manager::{HealthPolicy, OverallStats, ProxyManager, ProxyStatus};
pub use registry::ProxyRegistry;
pub use stats::ProxyStats;

/// Errors from the proxy admin surface.
///
/// Recording outcomes never fails; only explicit admin actions and
/// persistence can.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("Proxy storage error: {0}")]
    Storage(String),
}
