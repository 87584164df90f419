//! Subscriber client for the broadcast server.
//!
//! Each `SubscriberClient` runs as a tokio task that:
//! 1. Connects to the server's `/ws` endpoint.
//! 2. Sends the subscribe hello for its class.
//! 3. Decodes pushes and forwards them to a callback.
//! 4. Sends periodic text pings.
//! 5. Automatically reconnects on disconnection with bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::BtsError;
use crate::types::{ClientMessage, PushMessage, SubscriberClass};

/// Callback invoked for each decoded push.
pub type OnPushCallback = Arc<dyn Fn(PushMessage) + Send + Sync>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for one subscriber connection.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Server endpoint, e.g. `ws://127.0.0.1:8765/ws`.
    pub url: String,
    pub class: SubscriberClass,
    /// Interval between text `ping` messages.
    pub ping_interval: Option<Duration>,
    /// Upper bound of the reconnect backoff (default 30 s).
    pub max_backoff: Duration,
}

impl SubscriberConfig {
    pub fn new(url: impl Into<String>, class: impl Into<SubscriberClass>) -> Self {
        Self {
            url: url.into(),
            class: class.into(),
            ping_interval: None,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A subscriber connection managed by a background tokio task.
pub struct SubscriberClient {
    pub config: SubscriberConfig,
    outbound_tx: Option<mpsc::Sender<String>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SubscriberClient {
    /// Create a new (not yet started) client.
    pub fn new(config: SubscriberConfig) -> Self {
        Self {
            config,
            outbound_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Start the connection task; every push is handed to `on_push`.
    pub fn start(&mut self, on_push: OnPushCallback) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(16);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            connection_loop(config, on_push, outbound_rx, shutdown_rx).await;
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.outbound_tx = Some(outbound_tx);
        self.task = Some(task);
    }

    /// Send a raw text message (`get_latest`, a new hello, ...).
    pub async fn send(&self, msg: String) -> Result<(), BtsError> {
        if let Some(tx) = &self.outbound_tx {
            tx.send(msg)
                .await
                .map_err(|_| BtsError::WebSocket("client task has stopped".into()))?;
        }
        Ok(())
    }

    /// Ask the server for an immediate push.
    pub async fn request_latest(&self) -> Result<(), BtsError> {
        self.send("get_latest".to_string()).await
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Build the hello that declares `class`.
pub fn subscribe_message(class: &SubscriberClass) -> String {
    let hello = ClientMessage::Subscribe {
        class: class.clone(),
    };
    serde_json::to_string(&hello).unwrap_or_default()
}

/// Decode one text frame. Returns `None` for `pong` and non-push frames.
pub fn decode_push(text: &str) -> Option<PushMessage> {
    if text == "pong" {
        return None;
    }
    match serde_json::from_str::<PushMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("ignoring non-push frame: {e}");
            None
        }
    }
}

/// Main connection loop: connect, subscribe, read, ping, reconnect.
async fn connection_loop(
    config: SubscriberConfig,
    on_push: OnPushCallback,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let class = config.class.clone();

    loop {
        if *shutdown_rx.borrow() {
            info!("[subscriber:{class}] shutdown requested");
            return;
        }

        info!("[subscriber:{class}] connecting to {}", config.url);

        let ws_stream = match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((s, _response)) => {
                backoff = INITIAL_BACKOFF;
                info!("[subscriber:{class}] connected");
                s
            }
            Err(e) => {
                error!("[subscriber:{class}] connection failed: {e}, retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = shutdown_rx.changed() => return,
                }
                backoff = next_backoff(backoff, config.max_backoff);
                continue;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        'session: {
            if let Err(e) = ws_write.send(Message::Text(subscribe_message(&class).into())).await {
                error!("[subscriber:{class}] subscribe send failed: {e}");
                break 'session;
            }

            let mut ping = config
                .ping_interval
                .map(|p| tokio::time::interval_at(tokio::time::Instant::now() + p, p));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("[subscriber:{class}] shutdown signal received");
                        let _ = ws_write.close().await;
                        return;
                    }

                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(push) = decode_push(&text) {
                                    on_push(push);
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = ws_write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                warn!("[subscriber:{class}] received close frame");
                                break;
                            }
                            Some(Err(e)) => {
                                error!("[subscriber:{class}] read error: {e}");
                                break;
                            }
                            None => {
                                warn!("[subscriber:{class}] stream ended");
                                break;
                            }
                            _ => {}
                        }
                    }

                    Some(msg) = outbound_rx.recv() => {
                        if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                            error!("[subscriber:{class}] send error: {e}");
                            break;
                        }
                    }

                    _ = next_ping(&mut ping) => {
                        if let Err(e) = ws_write.send(Message::Text("ping".into())).await {
                            error!("[subscriber:{class}] ping send error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        warn!("[subscriber:{class}] disconnected, reconnecting in {backoff:?}");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = shutdown_rx.changed() => return,
        }
        backoff = next_backoff(backoff, config.max_backoff);
    }
}

/// Next ping tick; never resolves when pings are disabled.
async fn next_ping(ping: &mut Option<tokio::time::Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Double `current`, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
