//! Configuration file parser for ~/.config/feedmux/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning, since they are
//! usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::feed::{LoaderConfig, DEFAULT_MAX_RESPONSE_BYTES};
use crate::proxy::{default_proxies, HealthPolicy, ProxyDescriptor};

/// Environment variable that overrides `api_key`.
pub const API_KEY_ENV: &str = "FEEDMUX_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// Every field uses `#[serde(default)]` so any subset of keys can be given.
/// The custom `Debug` impl masks `api_key`.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Put the same-origin proxy ahead of every other candidate.
    pub prefer_local: bool,

    /// URL template of the same-origin proxy, if one is deployed.
    pub local_proxy: Option<String>,

    /// Premium proxy key substituted for `{api_key}` in templates.
    /// The `FEEDMUX_API_KEY` env var takes precedence.
    pub api_key: Option<String>,

    /// Proxy list. Empty means the built-in public list.
    pub proxies: Vec<ProxyDescriptor>,

    pub loader: LoaderSection,
    pub cache: CacheSection,
    pub health: HealthSection,
}

/// `[loader]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoaderSection {
    pub concurrency: usize,
    pub attempt_timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub max_response_bytes: usize,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            attempt_timeout_secs: 15,
            retry_delay_ms: 250,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: usize,
    pub max_size_bytes: usize,
    pub success_ttl_secs: u64,
    pub failure_ttl_secs: u64,
    pub discovery_ttl_secs: u64,
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_size_bytes: 10 * 1024 * 1024,
            success_ttl_secs: 3600,
            failure_ttl_secs: 300,
            discovery_ttl_secs: 86_400,
            default_ttl_secs: 1800,
            cleanup_interval_secs: 300,
        }
    }
}

/// `[health]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

/// Mask `api_key` in Debug output so it never reaches logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("prefer_local", &self.prefer_local)
            .field("local_proxy", &self.local_proxy)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("proxies", &self.proxies)
            .field("loader", &self.loader)
            .field("cache", &self.cache)
            .field("health", &self.health)
            .finish()
    }
}

const KNOWN_KEYS: [&str; 7] = [
    "prefer_local",
    "local_proxy",
    "api_key",
    "proxies",
    "loader",
    "cache",
    "health",
];

const SECTION_KEYS: [(&str, &[&str]); 3] = [
    (
        "loader",
        &[
            "concurrency",
            "attempt_timeout_secs",
            "retry_delay_ms",
            "max_response_bytes",
        ],
    ),
    (
        "cache",
        &[
            "max_entries",
            "max_size_bytes",
            "success_ttl_secs",
            "failure_ttl_secs",
            "discovery_ttl_secs",
            "default_ttl_secs",
            "cleanup_interval_secs",
        ],
    ),
    ("health", &["failure_threshold", "cooldown_secs"]),
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a huge file is never pulled into memory
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parses TOML text. Blank input yields defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            proxies = config.proxies.len(),
            prefer_local = config.prefer_local,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Configured proxies, or the built-in list when none are declared.
    pub fn proxy_list(&self) -> Vec<ProxyDescriptor> {
        if self.proxies.is_empty() {
            default_proxies()
        } else {
            self.proxies.clone()
        }
    }

    /// The same-origin proxy descriptor, if `local_proxy` is set.
    pub fn local_proxy_descriptor(&self) -> Option<ProxyDescriptor> {
        self.local_proxy
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|template| ProxyDescriptor::new("local", template).local())
    }

    /// API key from the environment, else from the file.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            concurrency: self.loader.concurrency.max(1),
            attempt_timeout: Duration::from_secs(self.loader.attempt_timeout_secs),
            retry_delay: Duration::from_millis(self.loader.retry_delay_ms),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let c = &self.cache;
        CacheConfig {
            max_size_bytes: c.max_size_bytes,
            max_entries: c.max_entries,
            success_ttl: Duration::from_secs(c.success_ttl_secs),
            failure_ttl: Duration::from_secs(c.failure_ttl_secs),
            discovery_ttl: Duration::from_secs(c.discovery_ttl_secs),
            default_ttl: Duration::from_secs(c.default_ttl_secs),
            cleanup_interval: Duration::from_secs(c.cleanup_interval_secs),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.health.failure_threshold.max(1),
            cooldown: Duration::from_secs(self.health.cooldown_secs),
        }
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let Some((_, allowed)) = SECTION_KEYS.iter().find(|(name, _)| name == key) else {
            continue;
        };
        if let Some(table) = value.as_table() {
            for sub in table.keys() {
                if !allowed.contains(&sub.as_str()) {
                    tracing::warn!(key = %format!("{key}.{sub}"), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("feedmux_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.prefer_local);
        assert!(config.local_proxy.is_none());
        assert!(config.api_key.is_none());
        assert!(config.proxies.is_empty());
        assert_eq!(config.loader.concurrency, 4);
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.health.failure_threshold, 3);
    }

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Config::default();
        assert_eq!(config.loader_config(), LoaderConfig::default());
        assert_eq!(config.cache_config(), CacheConfig::default());
        assert_eq!(config.health_policy(), HealthPolicy::default());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedmux_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.loader, LoaderSection::default());
    }

    #[test]
    fn test_empty_and_whitespace_files_return_default() {
        for (name, content) in [("empty", ""), ("whitespace", "   \n  \n  ")] {
            let path = write_config(name, content);
            let config = Config::load(&path).unwrap();
            assert!(config.proxies.is_empty());
            cleanup(&path);
        }
    }

    #[test]
    fn test_partial_section_uses_defaults_for_missing() {
        let path = write_config("partial", "[loader]\nconcurrency = 8\n");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.loader.concurrency, 8);
        assert_eq!(config.loader.attempt_timeout_secs, 15);
        assert_eq!(config.cache, CacheSection::default());

        cleanup(&path);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
prefer_local = true
local_proxy = "/proxy?url={url}"
api_key = "test-key-123"

[[proxies]]
name = "direct"
template = "direct"

[[proxies]]
name = "premium"
template = "https://premium.example/?key={api_key}&url={url}"
enabled = false

[loader]
concurrency = 6
attempt_timeout_secs = 10
retry_delay_ms = 0
max_response_bytes = 2048

[cache]
max_entries = 50
success_ttl_secs = 60

[health]
failure_threshold = 5
cooldown_secs = 120
"#;
        let path = write_config("full", content);
        let config = Config::load(&path).unwrap();

        assert!(config.prefer_local);
        assert_eq!(config.api_key.as_deref(), Some("test-key-123"));
        assert_eq!(config.proxies.len(), 2);
        assert!(config.proxies[0].enabled);
        assert!(!config.proxies[1].enabled);

        let local = config.local_proxy_descriptor().unwrap();
        assert!(local.local);
        assert_eq!(local.template, "/proxy?url={url}");

        let loader = config.loader_config();
        assert_eq!(loader.concurrency, 6);
        assert_eq!(loader.attempt_timeout, Duration::from_secs(10));
        assert!(loader.retry_delay.is_zero());
        assert_eq!(config.loader.max_response_bytes, 2048);

        let cache = config.cache_config();
        assert_eq!(cache.max_entries, 50);
        assert_eq!(cache.success_ttl, Duration::from_secs(60));
        assert_eq!(cache.failure_ttl, Duration::from_secs(300));

        assert_eq!(
            config.health_policy(),
            HealthPolicy {
                failure_threshold: 5,
                cooldown: Duration::from_secs(120),
            }
        );

        cleanup(&path);
    }

    #[test]
    fn test_empty_proxy_list_falls_back_to_builtin() {
        let config = Config::default();
        assert_eq!(config.proxy_list(), default_proxies());
        assert!(config.local_proxy_descriptor().is_none());
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        let config = Config::parse("[loader]\nconcurrency = 0\n").unwrap();
        assert_eq!(config.loader_config().concurrency, 1);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let path = write_config("invalid", "this is not [valid toml");

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));

        cleanup(&path);
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let content = r#"
prefer_local = true
totally_fake_key = "should not fail"

[loader]
concurency = 9
"#;
        let config = Config::parse(content).unwrap();
        assert!(config.prefer_local);
        assert_eq!(config.loader.concurrency, 4);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::parse("prefer_local = 42\n").is_err());
        assert!(Config::parse("[[proxies]]\nname = \"x\"\n").is_err());
    }

    #[test]
    fn test_too_large_file_rejected() {
        let path = write_config("too_large", &"a".repeat(1_048_577));

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        cleanup(&path);
    }

    #[test]
    fn test_file_at_size_limit_accepted() {
        let mut content = "prefer_local = true\n".to_string();
        while content.len() < 1_048_576 - 20 {
            content.push_str("# padding comment\n");
        }
        content.truncate(1_048_576);
        let path = write_config("at_limit", &content);

        assert!(Config::load(&path).is_ok());

        cleanup(&path);
    }

    #[test]
    fn test_debug_masks_api_key() {
        let config = Config {
            api_key: Some("super-secret-key-12345".to_string()),
            ..Config::default()
        };

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-key-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_debug_shows_none_when_no_api_key() {
        let debug_output = format!("{:?}", Config::default());
        assert!(debug_output.contains("api_key: None"));
        assert!(!debug_output.contains("[REDACTED]"));
    }
}
