use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedmux::cache::ValidationCache;
use feedmux::config::Config;
use feedmux::feed::{
    parse_sources, FeedRsParser, FeedValidator, HttpFetcher, LoadStatus, ProgressiveFeedLoader,
};
use feedmux::proxy::ProxyManager;
use feedmux::storage::{Database, DatabaseError, KeyValueStore};

/// Get the config directory path (~/.config/feedmux/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedmux"))
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // The preferences database holds the premium key; keep the directory private
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedmux",
    version,
    about = "Load RSS/Atom feeds progressively through health-ranked CORS proxies"
)]
struct Args {
    /// OPML subscription list (default: ~/.config/feedmux/feeds.opml)
    #[arg(long, value_name = "OPML")]
    feeds: Option<PathBuf>,

    /// Load this category first
    #[arg(long, value_name = "ID")]
    category: Option<String>,

    /// Config file (default: ~/.config/feedmux/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print proxy health and exit
    #[arg(long)]
    proxy_stats: bool,

    /// Enable a proxy by name and exit
    #[arg(long, value_name = "NAME")]
    enable_proxy: Option<String>,

    /// Disable a proxy by name and exit
    #[arg(long, value_name = "NAME")]
    disable_proxy: Option<String>,

    /// Check whether URL is a readable feed and exit
    #[arg(long, value_name = "URL")]
    validate: Option<String>,

    /// List the feeds advertised by a web page and exit
    #[arg(long, value_name = "URL")]
    discover: Option<String>,

    /// Clear all proxy statistics and exit
    #[arg(long)]
    reset_stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    ensure_config_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!(config = ?config, "Effective configuration");

    // Open preferences store
    let db_path = config_dir.join("prefs.db");
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of feedmux appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(db);

    // Wire the shared instances
    let mut manager =
        ProxyManager::new(config.proxy_list(), config.health_policy()).with_store(store);
    if let Some(local) = config.local_proxy_descriptor() {
        manager = manager.with_local_proxy(local);
    }
    manager.set_prefer_local(config.prefer_local);
    let proxies = Arc::new(manager);
    proxies
        .load()
        .await
        .context("Failed to restore proxy state")?;
    if let Some(key) = config.resolved_api_key() {
        proxies
            .set_api_key(Some(key))
            .await
            .context("Failed to store API key")?;
    }

    // Admin actions
    if let Some(name) = &args.enable_proxy {
        proxies.enable(name).await?;
        println!("Enabled proxy '{name}'");
        return Ok(());
    }
    if let Some(name) = &args.disable_proxy {
        proxies.disable(name).await?;
        println!("Disabled proxy '{name}'");
        return Ok(());
    }
    if args.reset_stats {
        proxies.reset_stats(None).await?;
        println!("Proxy statistics reset");
        return Ok(());
    }
    if args.proxy_stats {
        print_proxy_health(&proxies);
        return Ok(());
    }

    let cache = ValidationCache::new(config.cache_config());
    let fetcher = Arc::new(
        HttpFetcher::new(config.loader.max_response_bytes)
            .context("Failed to build HTTP client")?,
    );
    let parser = Arc::new(FeedRsParser);
    let loader_config = config.loader_config();

    if args.validate.is_some() || args.discover.is_some() {
        let validator = FeedValidator::new(
            proxies.clone(),
            fetcher,
            parser,
            loader_config.attempt_timeout,
        )
        .with_cache(cache.clone());

        if let Some(url) = &args.validate {
            let result = validator.validate(url).await;
            if result.valid {
                println!(
                    "{url}: valid feed \"{}\" with {} items",
                    result.title.as_deref().unwrap_or("Untitled"),
                    result.item_count
                );
            } else {
                println!(
                    "{url}: not a feed ({})",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        if let Some(url) = &args.discover {
            match validator.discover(url).await {
                Ok(feeds) => {
                    println!("Found {} feed(s) at {url}:", feeds.len());
                    for feed in feeds {
                        println!("  {feed}");
                    }
                }
                Err(e) => println!("{e}"),
            }
        }

        persist_quietly(&proxies).await;
        cache.destroy();
        return Ok(());
    }

    // Feed load
    let opml_path = args
        .feeds
        .clone()
        .unwrap_or_else(|| config_dir.join("feeds.opml"));
    if !opml_path.exists() {
        eprintln!("Error: No feeds file found at {}", opml_path.display());
        eprintln!();
        eprintln!("Pass one with --feeds /path/to/feeds.opml");
        std::process::exit(1);
    }
    let opml_path_str = opml_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
    let sources = parse_sources(opml_path_str)
        .await
        .context("Failed to parse OPML file")?;
    if sources.is_empty() {
        eprintln!("Warning: No valid feeds found in OPML file");
    } else {
        println!("Loaded {} feeds from {}", sources.len(), opml_path.display());
    }

    let loader = ProgressiveFeedLoader::new(proxies.clone(), fetcher, parser, loader_config)
        .with_cache(cache.clone());
    loader.set_sources(sources);

    let mut state_rx = loader.subscribe();
    let progress = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            println!("[{:>3}%] {}", state.progress, state.current_action);
            if state.is_resolved {
                break;
            }
        }
    });

    tokio::select! {
        _ = loader.load_feeds(false, args.category.as_deref()) => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling...");
            loader.cancel_loading();
            persist_quietly(&proxies).await;
        }
    }
    if let Err(e) = progress.await {
        tracing::warn!(error = %e, "Progress printer stopped unexpectedly");
    }

    // Summary
    let state = loader.state();
    let articles = loader.articles();
    println!();
    println!("Status: {:?}, {} articles", state.status, articles.len());
    if state.status != LoadStatus::Success {
        for failure in &state.errors {
            println!("  failed: {} ({})", failure.url, failure.reason);
        }
    }
    for article in articles.iter().take(20) {
        println!(
            "  [{}] {}",
            article.source_title.as_deref().unwrap_or(&article.source_url),
            article.title
        );
    }
    if articles.len() > 20 {
        println!("  ... and {} more", articles.len() - 20);
    }
    println!();
    print_proxy_health(&proxies);

    cache.destroy();
    Ok(())
}

async fn persist_quietly(proxies: &ProxyManager) {
    if let Err(e) = proxies.persist().await {
        tracing::warn!(error = %e, "Failed to persist proxy stats");
    }
}

fn print_proxy_health(proxies: &ProxyManager) {
    let overall = proxies.get_overall_stats();
    println!(
        "Proxies: {}/{} enabled, {} healthy, {} requests ({} ok, {} failed), avg {:.0} ms, best: {}",
        overall.enabled_proxies,
        overall.total_proxies,
        overall.healthy_proxies,
        overall.total_requests,
        overall.total_successes,
        overall.total_failures,
        overall.avg_response_time_ms,
        overall.best_proxy.as_deref().unwrap_or("none"),
    );
    for status in proxies.get_stats() {
        let flags = match (status.enabled, status.in_cooldown) {
            (false, _) => " [disabled]",
            (true, true) => " [cooldown]",
            (true, false) => "",
        };
        println!(
            "  {:<12} score {:.2}  {:>4}/{:<4} ok  {:>6.0} ms{}{}",
            status.name,
            status.stats.health_score,
            status.stats.success,
            status.stats.total_requests,
            status.stats.avg_response_time_ms,
            if status.local { " [local]" } else { "" },
            flags
        );
    }
}
