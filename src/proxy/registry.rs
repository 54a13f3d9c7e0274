use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::{ProxyDescriptor, ProxyError, ProxyStats};
use crate::storage::KeyValueStore;

const ENABLED_KEY_PREFIX: &str = "proxy.enabled.";
const STATS_KEY: &str = "proxy.stats";
const API_KEY_KEY: &str = "proxy.api_key";

/// The one mutable record kept per proxy name.
#[derive(Debug, Clone)]
pub(crate) struct ProxyRecord {
    pub descriptor: ProxyDescriptor,
    /// Created on the first recorded attempt.
    pub stats: Option<ProxyStats>,
    /// Set when consecutive failures reach the policy threshold. Not persisted.
    pub cooldown: Option<Cooldown>,
}

/// A cooldown window, kept as start plus length so arbitrarily long
/// windows never overflow `Instant`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cooldown {
    pub started: Instant,
    pub length: Duration,
}

impl ProxyRecord {
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown
            .is_some_and(|c| now.saturating_duration_since(c.started) < c.length)
    }

    pub fn stats_or_default(&self) -> ProxyStats {
        self.stats.clone().unwrap_or_default()
    }
}

/// Known proxies and their statistics.
///
/// Every mutation is a synchronous read-modify-write under one mutex, so
/// concurrent fetch completions never interleave inside an update. Writes to
/// the backing [`KeyValueStore`] happen after the lock is released.
pub struct ProxyRegistry {
    records: Mutex<Vec<ProxyRecord>>,
    api_key: Mutex<Option<SecretString>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl ProxyRegistry {
    /// Builds a registry from descriptors in priority order. Later duplicates
    /// of a name are dropped.
    pub fn new(descriptors: Vec<ProxyDescriptor>) -> Self {
        let mut records: Vec<ProxyRecord> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if records.iter().any(|r| r.descriptor.name == descriptor.name) {
                tracing::warn!(proxy = %descriptor.name, "Duplicate proxy name, ignoring");
                continue;
            }
            records.push(ProxyRecord {
                descriptor,
                stats: None,
                cooldown: None,
            });
        }

        Self {
            records: Mutex::new(records),
            api_key: Mutex::new(None),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Adds a descriptor after construction (used for the local proxy).
    /// Returns `false` if the name is taken.
    pub fn register(&self, descriptor: ProxyDescriptor) -> bool {
        let mut records = self.lock_records();
        if records.iter().any(|r| r.descriptor.name == descriptor.name) {
            return false;
        }
        records.push(ProxyRecord {
            descriptor,
            stats: None,
            cooldown: None,
        });
        true
    }

    pub fn names(&self) -> Vec<String> {
        self.lock_records()
            .iter()
            .map(|r| r.descriptor.name.clone())
            .collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<ProxyDescriptor> {
        self.lock_records()
            .iter()
            .find(|r| r.descriptor.name == name)
            .map(|r| r.descriptor.clone())
    }

    pub(crate) fn lock_records(&self) -> MutexGuard<'_, Vec<ProxyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to the named record. Returns `None` for unknown names.
    pub(crate) fn update<R>(&self, name: &str, f: impl FnOnce(&mut ProxyRecord) -> R) -> Option<R> {
        let mut records = self.lock_records();
        records
            .iter_mut()
            .find(|r| r.descriptor.name == name)
            .map(f)
    }

    // ========================================================================
    // Premium API key
    // ========================================================================

    pub(crate) fn set_api_key_in_memory(&self, key: Option<SecretString>) {
        *self.api_key.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Builds the proxied URL, substituting the API key without copying it out.
    pub fn wrap(&self, descriptor: &ProxyDescriptor, target: &str) -> String {
        let key = self.api_key.lock().unwrap_or_else(PoisonError::into_inner);
        descriptor.wrap(target, key.as_ref().map(|k| k.expose_secret()))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Restores enabled flags, stats and the API key from the store.
    ///
    /// Stats for names no longer registered are ignored. Corrupt stats JSON
    /// is logged and skipped rather than failing startup.
    pub async fn load(&self) -> Result<(), ProxyError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let mut flags = HashMap::new();
        for name in self.names() {
            let key = format!("{ENABLED_KEY_PREFIX}{name}");
            if let Some(value) = store.get_string(&key).await.map_err(storage_err)? {
                flags.insert(name, value == "true");
            }
        }

        let stats: HashMap<String, ProxyStats> =
            match store.get_string(STATS_KEY).await.map_err(storage_err)? {
                Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Discarding unreadable persisted proxy stats");
                    HashMap::new()
                }),
                None => HashMap::new(),
            };

        let api_key = store.get_string(API_KEY_KEY).await.map_err(storage_err)?;

        {
            let mut records = self.lock_records();
            for record in records.iter_mut() {
                if let Some(enabled) = flags.get(&record.descriptor.name) {
                    record.descriptor.enabled = *enabled;
                }
                if let Some(saved) = stats.get(&record.descriptor.name) {
                    let mut saved = saved.clone();
                    // Older snapshots may predate a counter; keep the invariant.
                    saved.total_requests = saved.success.saturating_add(saved.failures);
                    saved.health_score = saved.compute_health_score();
                    record.stats = Some(saved);
                }
            }
        }

        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            self.set_api_key_in_memory(Some(SecretString::from(key)));
        }

        tracing::debug!(
            flags = flags.len(),
            stats = stats.len(),
            "Restored proxy state"
        );
        Ok(())
    }

    /// Writes every proxy's stats as one JSON document.
    pub async fn persist_stats(&self) -> Result<(), ProxyError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let snapshot: HashMap<String, ProxyStats> = self
            .lock_records()
            .iter()
            .filter_map(|r| r.stats.clone().map(|s| (r.descriptor.name.clone(), s)))
            .collect();

        let json = serde_json::to_string(&snapshot)
            .map_err(|e| ProxyError::Storage(e.to_string()))?;
        store.set_string(STATS_KEY, &json).await.map_err(storage_err)
    }

    pub(crate) async fn persist_enabled(&self, name: &str, enabled: bool) -> Result<(), ProxyError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let key = format!("{ENABLED_KEY_PREFIX}{name}");
        store
            .set_string(&key, if enabled { "true" } else { "false" })
            .await
            .map_err(storage_err)
    }

    pub(crate) async fn persist_api_key(&self, key: Option<&str>) -> Result<(), ProxyError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .set_string(API_KEY_KEY, key.unwrap_or(""))
            .await
            .map_err(storage_err)
    }
}

fn storage_err(e: anyhow::Error) -> ProxyError {
    ProxyError::Storage(e.to_string())
}
