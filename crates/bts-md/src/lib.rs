//! # bts-md
//!
//! Market data collection for the BTS feed.
//!
//! ## Architecture
//!
//! Each upstream provides a `build(config, fetchers) -> Arc<dyn Source>`
//! function describing how to fetch its metric families. The generic
//! [`collector::Collector`] drives any [`source::Source`] at an adaptive
//! cadence and writes into the shared snapshot store; [`pipeline::PollingMd`]
//! wraps one collector task behind the [`MdModule`] lifecycle.
//!
//! ## Shared infrastructure
//!
//! - [`fetcher`]: rate budget, 429 backoff gate and HTTP JSON fetches
//! - [`source`]: `Source` trait and per-source settings resolution
//! - [`collector`]: adaptive fetch/validate/store loop
//! - [`pipeline`]: `PollingMd` module lifecycle
//! - [`registry`]: factory from config to modules
//! - [`json_util`]: JSON parsing helpers

pub mod coingecko;
pub mod collector;
pub mod fetcher;
pub mod fx;
pub mod json_util;
pub mod pipeline;
pub mod registry;
pub mod source;
pub mod upbit;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::collector::CollectorStatus;

/// Trait implemented by all market data modules.
///
/// Only `Send` is required (not `Sync`) because modules are accessed
/// sequentially by the runner, never concurrently.
#[async_trait]
pub trait MdModule: Send {
    /// Human-readable module name.
    fn name(&self) -> &str;
    /// Live status of the module's collector.
    fn status(&self) -> watch::Receiver<CollectorStatus>;
    /// Begin collecting.
    async fn start(&mut self) -> Result<()>;
    /// Stop collecting; an in-flight fetch is abandoned.
    async fn stop(&mut self) -> Result<()>;
}
