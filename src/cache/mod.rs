//! In-memory validation and discovery cache.
//!
//! Feed validation and discovery each cost several proxied round trips. The
//! [`ValidationCache`] memoizes their results (and the loader's per-source
//! article lists) with a TTL chosen by result class, evicts least-recently
//! used entries to stay inside entry-count and byte budgets, and supports
//! glob-style bulk invalidation.
//!
//! Build one instance at startup with [`ValidationCache::new`] and share the
//! `Arc` with every consumer.

mod entry;
mod pattern;
mod size;
mod validation;

use thiserror::Error;

pub use entry::{CacheConfig, CacheConfigUpdate, CacheEntry, CacheStats, TtlClass, TtlDistribution};
pub use pattern::KeyPattern;
pub use size::estimate_size;
pub use validation::ValidationCache;

/// A cache write that could not be honored.
///
/// Never fatal: callers log it and carry on without caching.
#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("Failed to serialize cache value: {0}")]
    Serialize(String),

    #[error("Entry of {size} bytes exceeds cache budget of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Cache has been destroyed")]
    Destroyed,
}
