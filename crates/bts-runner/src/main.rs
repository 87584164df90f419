//! # bts-runner
//!
//! Entry point for the BTS market data feed.
//!
//! `serve` loads a JSON configuration file, creates one polling module per
//! enabled data source, and runs the broadcaster and the WebSocket server
//! until Ctrl+C. `watch` connects a subscriber to a running feed and logs
//! every push.
//!
//! # Usage
//!
//! ```bash
//! bts-runner serve config.json --log-level info
//! bts-runner watch --url ws://127.0.0.1:8765/ws --class dashboard
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bts_cast::{AppState, Broadcaster};
use bts_core::activity::ActivityTracker;
use bts_core::config::AppConfig;
use bts_core::registry::SubscriptionRegistry;
use bts_core::settings::CadenceSettings;
use bts_core::store::SnapshotStore;
use bts_core::types::BroadcastPolicy;
use bts_core::ws::{SubscriberClient, SubscriberConfig};
use bts_md::MdModule;
use bts_md::fetcher::FetcherPool;
use bts_md::registry::{ModuleContext, create_md_module};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// BTS market data feed.
#[derive(Parser)]
#[command(name = "bts-runner", about = "BTS market data collector and push server")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run collectors, broadcaster and server.
    Serve {
        /// Configuration file path (JSON).
        config: PathBuf,

        /// Optional log directory for file output (overrides the config).
        #[arg(long)]
        log_dir: Option<String>,
    },
    /// Subscribe to a running feed and log every push.
    Watch {
        #[arg(long, default_value = "ws://127.0.0.1:8765/ws")]
        url: String,

        #[arg(long, default_value = "dashboard")]
        class: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, log_dir } => serve(config, &cli.log_level, log_dir).await,
        Command::Watch { url, class } => watch_feed(url, class, &cli.log_level).await,
    }
}

async fn serve(path: PathBuf, log_level: &str, log_dir: Option<String>) -> Result<()> {
    // 1. Load configuration, then initialize logging with its module name
    let config = bts_core::config::load_config(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let log_dir = log_dir.or_else(|| config.log_path());
    bts_core::logging::init_logging(
        log_level,
        log_dir.as_deref(),
        &config.module_name(),
        config.log_json(),
    );

    info!("{} starting, config={}, log_level={log_level}", config.module_name(), path.display());

    // 2. Shared state
    let store = Arc::new(SnapshotStore::new());
    let registry = Arc::new(SubscriptionRegistry::new(config.server.effective_queue_depth()));
    apply_class_policies(&config, &registry);
    let cadence = Arc::new(CadenceSettings::from_config(&config.cadence)?);
    let fetchers = Arc::new(FetcherPool::from_config(&config.effective_rate_limits())?);

    let ctx = ModuleContext {
        store: store.clone(),
        activity: ActivityTracker::new(registry.clone()),
        cadence: cadence.subscribe(),
        fetchers,
    };

    // 3. Create and start one module per enabled source
    let mut md_modules: Vec<Box<dyn MdModule>> = Vec::new();
    for (idx, source) in config.effective_sources().iter().enumerate() {
        if !source.is_enabled() {
            info!("source[{idx}]: '{}' disabled, skipping", source.label());
            continue;
        }
        match create_md_module(source, &ctx) {
            Ok(module) => {
                info!("source[{idx}]: created module '{}' (kind={})", module.name(), source.source);
                md_modules.push(module);
            }
            Err(e) => {
                error!("source[{idx}]: failed to create module for '{}': {e}", source.source);
            }
        }
    }

    let mut md_modules = start_modules(md_modules).await;

    // 4. Broadcaster and server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let idle = config.broadcast.effective_idle_interval();
    let broadcaster = Broadcaster::new(store.clone(), registry.clone(), idle);
    let broadcaster = tokio::spawn(broadcaster.run(shutdown_rx.clone()));

    let state = AppState {
        store,
        registry,
        cadence,
        collectors: Arc::new(md_modules.iter().map(|m| m.status()).collect()),
        ping_interval: config.server.effective_ping_interval(),
        started_at: Instant::now(),
        shutdown: shutdown_rx,
    };
    let bind = config.server.effective_bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let server = tokio::spawn(bts_cast::serve(listener, state));

    info!("all {} module(s) started, press Ctrl+C to stop", md_modules.len());

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // 6. Stop everything
    for module in &mut md_modules {
        info!("stopping module '{}'", module.name());
        if let Err(e) = module.stop().await {
            error!("error stopping '{}': {e}", module.name());
        }
    }
    if let Err(e) = broadcaster.await {
        error!("broadcaster task failed: {e}");
    }
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("server error: {e}"),
        Ok(Err(e)) => error!("server task failed: {e}"),
        Err(_) => warn!("server did not stop within 5s"),
    }

    info!("all modules stopped, goodbye");
    Ok(())
}

/// Start every module; one that fails to start is logged and dropped.
async fn start_modules(modules: Vec<Box<dyn MdModule>>) -> Vec<Box<dyn MdModule>> {
    let mut started = Vec::with_capacity(modules.len());
    for mut module in modules {
        match module.start().await {
            Ok(()) => {
                info!("module '{}' started", module.name());
                started.push(module);
            }
            Err(e) => error!("module '{}' failed to start: {e}", module.name()),
        }
    }
    started
}

fn apply_class_policies(config: &AppConfig, registry: &SubscriptionRegistry) {
    for (class, policy) in config.broadcast.effective_classes() {
        let keys = policy.effective_keys();
        let policy = BroadcastPolicy {
            enabled: policy.enabled,
            interval: Duration::from_secs(policy.interval_sec),
        };
        registry.set_policy(class.into(), policy, Some(keys));
    }
}

async fn watch_feed(url: String, class: String, log_level: &str) -> Result<()> {
    bts_core::logging::init_logging(log_level, None, "bts-watch", false);

    let mut client = SubscriberClient::new(SubscriberConfig {
        ping_interval: Some(Duration::from_secs(20)),
        ..SubscriberConfig::new(url, class)
    });
    client.start(Arc::new(|push| {
        info!(
            "[watch] {} push at {}: {} metric(s)",
            push.class_tag,
            push.timestamp,
            push.metrics.len()
        );
        for (key, entry) in &push.metrics {
            info!("[watch]   {key} = {} (age {} ms)", entry.value, entry.age_ms);
        }
    }));

    tokio::signal::ctrl_c().await?;
    client.stop().await;
    Ok(())
}
