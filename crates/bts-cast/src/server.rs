//! HTTP / WebSocket surface.
//!
//! - `GET /ws?class=<name>`: subscriber socket. Without `class` the socket
//!   waits for a JSON hello; a later hello moves it to another class.
//!   Text `ping` is answered with `pong`, `get_latest` with an immediate push.
//! - `GET /health`, `GET /status`
//! - `GET /snapshots`, `GET /snapshots/{key}`
//! - `PUT /admin/policies/{class}`, `PUT /admin/cadence`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use bts_core::config::ClassPolicyConfig;
use bts_core::registry::SubscriptionRegistry;
use bts_core::settings::CadenceSettings;
use bts_core::store::SnapshotStore;
use bts_core::time_util;
use bts_core::types::{
    BroadcastPolicy, ClientMessage, ConnectionId, MetricEntry, MetricKey, PushFrame, PushMessage,
    SubscriberClass,
};
use bts_md::collector::CollectorStatus;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SnapshotStore>,
    pub registry: Arc<SubscriptionRegistry>,
    pub cadence: Arc<CadenceSettings>,
    pub collectors: Arc<Vec<watch::Receiver<CollectorStatus>>>,
    /// Interval of WebSocket ping frames.
    pub ping_interval: Duration,
    pub started_at: Instant,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/snapshots", get(snapshots))
        .route("/snapshots/{key}", get(snapshot))
        .route("/admin/policies/{class}", put(set_class_policy))
        .route("/admin/cadence", put(set_cadence))
        .with_state(state)
}

/// Serve on `listener` until `state.shutdown` flips to `true`.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    info!("[server] listening on {}", listener.local_addr()?);
    let mut shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("[server] shutting down");
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsParams {
    class: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let class = params.class.filter(|c| !c.is_empty()).map(SubscriberClass::from);
    ws.on_upgrade(move |socket| handle_socket(socket, state, class))
}

/// A socket's registration in the registry.
struct Session {
    id: ConnectionId,
    class: SubscriberClass,
    rx: mpsc::Receiver<PushFrame>,
}

impl Session {
    fn open(registry: &SubscriptionRegistry, class: SubscriberClass) -> Self {
        let (id, rx) = registry.subscribe(class.clone());
        Self { id, class, rx }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, class: Option<SubscriberClass>) {
    if *state.shutdown.borrow() {
        return;
    }
    let mut session = class.map(|c| Session::open(&state.registry, c));
    let mut shutdown = state.shutdown.clone();
    let period = state.ping_interval.max(Duration::from_secs(1));
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        let sent = on_text(&mut socket, &state, &mut session, text.as_str()).await;
                        if let Err(e) = sent {
                            debug!("[ws] send failed: {e}");
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            frame = next_frame(&mut session) => match frame {
                Some(frame) => {
                    if send_push(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    // dropped by the registry after a failed delivery
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },

            _ = ping.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Some(session) = session {
        state.registry.unsubscribe(session.id);
    }
}

async fn next_frame(session: &mut Option<Session>) -> Option<PushFrame> {
    match session {
        Some(s) => s.rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn on_text(
    socket: &mut WebSocket,
    state: &AppState,
    session: &mut Option<Session>,
    text: &str,
) -> Result<(), axum::Error> {
    match text.trim() {
        "ping" => socket.send(Message::Text("pong".into())).await,
        "get_latest" => match session {
            Some(s) => send_push(socket, &latest(state, &s.class)).await,
            None => Ok(()),
        },
        other => {
            match serde_json::from_str::<ClientMessage>(other) {
                Ok(hello) => {
                    let class = hello.class().clone();
                    if session.as_ref().is_some_and(|s| s.class == class) {
                        return Ok(());
                    }
                    if let Some(old) = session.take() {
                        state.registry.unsubscribe(old.id);
                    }
                    *session = Some(Session::open(&state.registry, class));
                }
                Err(e) => debug!("[ws] ignoring message: {e}"),
            }
            Ok(())
        }
    }
}

/// Current selection of `class`, built outside the broadcast cadence.
fn latest(state: &AppState, class: &SubscriberClass) -> PushFrame {
    let keys = state.registry.class_keys(class.as_str());
    let snapshots = state.store.select(&keys);
    Arc::new(PushMessage::from_snapshots(
        class.clone(),
        time_util::now_ms(),
        snapshots.into_values(),
    ))
}

async fn send_push(socket: &mut WebSocket, frame: &PushMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("[ws] push for '{}' not serializable: {e}", frame.class_tag);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct ClassView {
    pub enabled: bool,
    pub interval_sec: u64,
    pub keys: Vec<String>,
    pub connections: usize,
}

#[derive(Debug, Serialize)]
pub struct CadenceView {
    pub interactive_class: String,
    pub fast_interval_sec: u64,
    pub slow_interval_sec: u64,
    pub allowed_slow_intervals_sec: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub uptime_sec: u64,
    pub connections: usize,
    pub classes: BTreeMap<SubscriberClass, ClassView>,
    pub cadence: CadenceView,
    pub collectors: Vec<CollectorStatus>,
}

fn cadence_view(settings: &CadenceSettings) -> CadenceView {
    let c = settings.current();
    CadenceView {
        interactive_class: c.interactive_class.to_string(),
        fast_interval_sec: c.fast.as_secs(),
        slow_interval_sec: c.slow.as_secs(),
        allowed_slow_intervals_sec: settings
            .allowed_slow_intervals()
            .iter()
            .map(Duration::as_secs)
            .collect(),
    }
}

fn class_view(registry: &SubscriptionRegistry, class: &str) -> ClassView {
    let policy = registry.get_policy(class);
    ClassView {
        enabled: policy.enabled,
        interval_sec: policy.interval.as_secs(),
        keys: registry.class_keys(class),
        connections: registry.connection_count(class),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusView> {
    let registry = &state.registry;
    // connected classes without a policy show up as disabled
    let mut classes = BTreeMap::new();
    for class in registry.classes().into_keys().chain(registry.connection_counts().into_keys()) {
        let view = class_view(registry, class.as_str());
        classes.insert(class, view);
    }

    Json(StatusView {
        uptime_sec: state.started_at.elapsed().as_secs(),
        connections: registry.total_connections(),
        classes,
        cadence: cadence_view(&state.cadence),
        collectors: state.collectors.iter().map(|rx| rx.borrow().clone()).collect(),
    })
}

async fn snapshots(State(state): State<AppState>) -> Json<BTreeMap<MetricKey, MetricEntry>> {
    let now = time_util::now_ms();
    let entries = state
        .store
        .select(&["*"])
        .into_iter()
        .map(|(key, s)| {
            let age_ms = s.age_ms(now);
            let entry = MetricEntry {
                value: s.value,
                fetched_at: s.fetched_at,
                age_ms,
            };
            (key, entry)
        })
        .collect();
    Json(entries)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub key: MetricKey,
    pub value: serde_json::Value,
    pub fetched_at: u64,
    pub age_ms: u64,
    pub owner: Option<String>,
    pub rejected: u64,
    pub last_rejected_at: Option<u64>,
}

async fn snapshot(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SnapshotView>, StatusCode> {
    let snap = state.store.get(&key).ok_or(StatusCode::NOT_FOUND)?;
    let stats = state.store.guard_stats(&key).unwrap_or_default();
    Ok(Json(SnapshotView {
        age_ms: snap.age_ms(time_util::now_ms()),
        key: snap.key,
        value: snap.value,
        fetched_at: snap.fetched_at,
        owner: state.store.owner(&key),
        rejected: stats.rejected,
        last_rejected_at: stats.last_rejected_at,
    }))
}

async fn set_class_policy(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(body): Json<ClassPolicyConfig>,
) -> Json<ClassView> {
    let policy = BroadcastPolicy {
        enabled: body.enabled,
        interval: Duration::from_secs(body.interval_sec),
    };
    state.registry.set_policy(class.as_str().into(), policy, body.keys);
    Json(class_view(&state.registry, &class))
}

#[derive(Debug, Default, Deserialize)]
pub struct CadenceUpdate {
    pub fast_interval_sec: Option<u64>,
    pub slow_interval_sec: Option<u64>,
}

async fn set_cadence(
    State(state): State<AppState>,
    Json(body): Json<CadenceUpdate>,
) -> Result<Json<CadenceView>, (StatusCode, String)> {
    let bad_request = |e: bts_core::error::BtsError| (StatusCode::BAD_REQUEST, e.to_string());
    if let Some(slow) = body.slow_interval_sec {
        state.cadence.set_slow_interval(Duration::from_secs(slow)).map_err(bad_request)?;
    }
    if let Some(fast) = body.fast_interval_sec {
        state.cadence.set_fast_interval(Duration::from_secs(fast)).map_err(bad_request)?;
    }
    Ok(Json(cadence_view(&state.cadence)))
}
