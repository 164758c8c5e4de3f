use std::{future::Future, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bridge_proto::{Envelope, PeerClass};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    registry::{DispatchMetrics, RegistrySnapshot, RelayRegistry},
};

pub struct RelayState {
    registry: RelayRegistry,
    access_token: Option<String>,
    metrics: Option<PrometheusHandle>,
    started: Instant,
}

impl RelayState {
    pub fn new(config: &RelayConfig, metrics: Option<PrometheusHandle>) -> Arc<Self> {
        Arc::new(Self {
            registry: RelayRegistry::new(config.queue_depth),
            access_token: config.access_token.clone(),
            metrics,
            started: Instant::now(),
        })
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    fn stats(&self) -> StatsResponse {
        let snapshot = self.registry.snapshot();
        StatsResponse {
            active_connections: snapshot.active(),
            uptime_secs: self.started.elapsed().as_secs(),
            registry: snapshot,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    uptime_secs: u64,
    #[serde(flatten)]
    registry: RegistrySnapshot,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "type")]
    class: Option<String>,
    uid: Option<String>,
    token: Option<String>,
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Binds the configured address and serves until ctrl-c, then lets open
/// connections drain for the grace period.
pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("bridge relay listening on {}", config.listen_addr);

    let state = RelayState::new(&config, metrics);
    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "relay stopped accepting; waiting before exit"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("relay shut down");
    Ok(())
}

/// Serves the relay on `listener` until `shutdown` resolves. Every open
/// connection is sent a close frame when that happens.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = registry.close_all("relay shutting down");
            info!(closed, "closing relay connections");
        })
        .await
        .context("server shutdown with error")
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let class = PeerClass::from_param(query.class.as_deref());
    if let Some(expected) = &state.access_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            counter!(
                "bridge_relay_token_rejections_total",
                1,
                "class" => class.label()
            );
            warn!(%class, uid = ?query.uid, "connection rejected: token mismatch");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let uid = query.uid.unwrap_or_default();
    debug!(%class, %uid, token_present = query.token.is_some(), "upgrading connection");
    ws.on_upgrade(move |socket| handle_connection(socket, state, class, uid))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<RelayState>, class: PeerClass, uid: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let registration = state.registry.register(&uid, class);
    let connection_id = registration.id.clone();
    let mut rx = registration.receiver;
    on_connection_added(class, registration.active_in_class);
    info!(%connection_id, %class, "connection registered");

    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        debug!(connection_id = %writer_connection, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(frame) => match frame {
                Message::Close(frame) => {
                    info!(
                        %connection_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Message::Text(_) | Message::Binary(_) => {
                    inspect_frame(class, &frame);
                    let metrics = state.registry.dispatch(class, frame);
                    record_dispatch(class, &metrics);
                }
                _ => continue,
            },
            Err(err) => {
                warn!(%connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    match state.registry.unregister(&connection_id) {
        Some(removal) => on_connection_removed(removal.class, removal.active_in_class),
        None => debug!(%connection_id, "connection already evicted"),
    }
    writer.abort();
    info!(%connection_id, %class, "connection closed");
}

/// Decodes signaling frames for logging only; the relayed text is never
/// altered and undecodable frames are still forwarded.
fn inspect_frame(class: PeerClass, frame: &Message) {
    let Message::Text(text) = frame else {
        return;
    };
    match Envelope::decode(text) {
        Ok(envelope) => {
            debug!(%class, kind = envelope.kind(), bytes = text.len(), "relaying signal");
        }
        Err(err) => {
            counter!(
                "bridge_relay_undecodable_frames_total",
                1,
                "class" => class.label()
            );
            debug!(%class, error = %err, "relaying frame that is not a signaling envelope");
        }
    }
}

fn record_dispatch(class: PeerClass, metrics: &DispatchMetrics) {
    if metrics.delivered == 0 {
        return;
    }
    counter!(
        "bridge_relay_frames_forwarded_total",
        metrics.delivered as u64,
        "class" => class.label()
    );
    if metrics.bytes > 0 {
        counter!(
            "bridge_relay_bytes_forwarded_total",
            metrics.bytes as u64,
            "class" => class.label()
        );
        histogram!(
            "bridge_relay_frame_size_bytes",
            metrics.bytes as f64 / metrics.delivered as f64,
            "class" => class.label()
        );
    }
}

fn on_connection_added(class: PeerClass, active: usize) {
    gauge!(
        "bridge_relay_connections_active",
        active as f64,
        "class" => class.label()
    );
    counter!(
        "bridge_relay_connections_total",
        1,
        "class" => class.label()
    );
}

fn on_connection_removed(class: PeerClass, active: usize) {
    gauge!(
        "bridge_relay_connections_active",
        active as f64,
        "class" => class.label()
    );
    counter!(
        "bridge_relay_connections_closed_total",
        1,
        "class" => class.label()
    );
}
