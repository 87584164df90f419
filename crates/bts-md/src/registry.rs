//! Module registry: factory for creating MD modules from config.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bts_core::activity::ActivityTracker;
use bts_core::config::SourceConfig;
use bts_core::settings::Cadence;
use bts_core::store::SnapshotStore;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::MdModule;
use crate::collector::Collector;
use crate::fetcher::FetcherPool;
use crate::pipeline::PollingMd;
use crate::source::Source;

/// Shared handles every module is built against.
#[derive(Clone)]
pub struct ModuleContext {
    pub store: Arc<SnapshotStore>,
    pub activity: ActivityTracker,
    pub cadence: watch::Receiver<Cadence>,
    pub fetchers: Arc<FetcherPool>,
}

/// Create the [`Source`] named by the `source` field in the config.
pub fn create_source(config: &SourceConfig, fetchers: &FetcherPool) -> Result<Arc<dyn Source>> {
    match config.source.to_lowercase().as_str() {
        "upbit" => crate::upbit::build(config, fetchers),
        "fx" => crate::fx::build(config, fetchers),
        "coingecko_global" => crate::coingecko::build_global(config, fetchers),
        "coingecko_markets" => crate::coingecko::build_markets(config, fetchers),
        other => Err(anyhow!("Unknown source: {other}")),
    }
}

/// Create an `MdModule` for one source config.
///
/// Registers every key of the source in the store with its validity rule
/// (a rule in `validators` overrides the source default), so a second source
/// claiming the same key fails here rather than at runtime.
pub fn create_md_module(config: &SourceConfig, ctx: &ModuleContext) -> Result<Box<dyn MdModule>> {
    let source = create_source(config, &ctx.fetchers)?;
    let metrics = source.metrics();
    let count = metrics.len();

    if let Some(validators) = &config.validators {
        for key in validators.keys() {
            if !metrics.iter().any(|(k, _)| k.as_str() == key) {
                warn!("[{}] validator for unknown key '{key}' ignored", source.id());
            }
        }
    }

    for (key, default_rule) in metrics {
        let rule = config.validator_for(key.as_str()).cloned().unwrap_or(default_rule);
        ctx.store.register(key, source.id(), rule.into_validator())?;
    }

    info!(
        "[{}] registered {} metrics, min interval {:?}",
        source.id(),
        count,
        source.min_interval()
    );
    let name = source.id().to_string();
    let collector = Collector::new(
        source,
        ctx.store.clone(),
        ctx.activity.clone(),
        ctx.cadence.clone(),
    );
    Ok(Box::new(PollingMd::new(name, collector)))
}
