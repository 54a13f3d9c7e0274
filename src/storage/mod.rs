//! Key-value persistence for proxy flags, proxy statistics and the premium key.
//!
//! [`KeyValueStore`] is the seam the proxy registry writes through. Two
//! implementations ship: [`Database`] (SQLite, survives restarts) and
//! [`MemoryStore`] (process lifetime, used by tests).

mod memory;
mod preferences;
mod schema;
mod types;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use schema::Database;
pub use types::DatabaseError;

/// String key-value storage.
///
/// Keys use a dotted convention: `proxy.enabled.<name>`, `proxy.stats`,
/// `proxy.api_key`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the stored value, or `None` if the key was never set.
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Inserts or replaces the value for `key`.
    async fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()>;
}
