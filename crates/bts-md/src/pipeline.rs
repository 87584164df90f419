//! Polling module engine.
//!
//! Provides [`PollingMd`]: the [`MdModule`] implementation that owns one
//! [`Collector`] task. Each source only needs a `build()` function producing
//! a [`Source`](crate::source::Source); the engine handles spawning,
//! status publication and bounded shutdown.
//!
//! ```text
//! Source ──► Collector ──► PollingMd.start() ──► tokio task
//!                          PollingMd.stop()  ──► shutdown signal, join (bounded), abort
//! ```

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::MdModule;
use crate::collector::{Collector, CollectorStatus};

/// How long `stop()` waits for the collector task before aborting it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Market data module driving one collector.
pub struct PollingMd {
    name: String,
    collector: Option<Collector>,
    status: watch::Receiver<CollectorStatus>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PollingMd {
    pub fn new(name: String, collector: Collector) -> Self {
        let status = collector.status();
        Self {
            name,
            collector: Some(collector),
            status,
            shutdown_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl MdModule for PollingMd {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> watch::Receiver<CollectorStatus> {
        self.status.clone()
    }

    async fn start(&mut self) -> Result<()> {
        let Some(collector) = self.collector.take() else {
            bail!("module '{}' already started", self.name);
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.task = Some(tokio::spawn(collector.run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        info!("[{}] started", self.name);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("[{}] collector did not stop within {STOP_TIMEOUT:?}, aborting", self.name);
                task.abort();
            }
        }
        info!("[{}] stopped", self.name);
        Ok(())
    }
}
