//! Connection handlers for the Tandem server.
//!
//! This module owns the HTTP router and the per-connection WebSocket loop.
//! Each connection runs one task that multiplexes inbound frames, its
//! outbound queue from the hub and a heartbeat timer.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{ConnectionId, HubConfig, MemoryDocumentStore, SessionHub, SyncError};
use tandem_protocol::{codec, ClientEvent, ServerEvent, PROTOCOL_VERSION};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The session engine.
    pub hub: SessionHub,
    /// Server configuration.
    pub config: Config,
    /// One permit per allowed connection, held by its worker.
    connection_slots: Arc<Semaphore>,
}

impl AppState {
    /// Create new app state backed by an in-memory document store.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub_config = HubConfig {
            outbound_capacity: config.limits.outbound_queue_capacity,
        };

        let slots = config.limits.max_connections.min(Semaphore::MAX_PERMITS);

        Self {
            hub: SessionHub::with_config(Arc::new(MemoryDocumentStore::new()), hub_config),
            connection_slots: Arc::new(Semaphore::new(slots)),
            config,
        }
    }
}

/// Encoding a connection last spoke in; replies use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    MessagePack,
}

type WsSender = SplitSink<WebSocket, Message>;

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api", api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));
    let ws_path = state.config.transport.websocket_path.clone();

    let listener = TcpListener::bind(addr).await?;

    info!("Tandem server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "activeDocuments": stats.active_documents,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Ok(slot) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        let limit = state.config.limits.max_connections;
        warn!(limit = limit, "Connection limit reached, rejecting upgrade");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    // A failed upgrade drops the closure, and the slot with it.
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: OwnedSemaphorePermit) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let mut outbound = match state.hub.connect(&connection_id) {
        Ok(outbound) => outbound,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to register connection");
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Clients learn the encoding from their own first frame; greet in JSON.
    let mut encoding = Encoding::Json;
    let heartbeat = &state.config.heartbeat;
    let welcome = ServerEvent::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION.major,
        u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    if let Err(e) = send_event(&mut sender, &welcome, encoding).await {
        error!(connection = %connection_id, error = %e, "Failed to send connected event");
        state.hub.disconnect(&connection_id);
        return;
    }

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let idle_timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat.interval_ms.max(1)));
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events queued by the hub for this connection
            event = outbound.recv() => {
                let Some(event) = event else {
                    // Sender dropped: the hub evicted us.
                    info!(connection = %connection_id, "Connection evicted");
                    break;
                };
                if let Err(e) = send_event(&mut sender, &event, encoding).await {
                    debug!(connection = %connection_id, error = %e, "Outbound send failed");
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        metrics::record_message(text.len(), "inbound");
                        let event = codec::decode_json::<ClientEvent>(&text).map_err(SyncError::from);
                        dispatch(&state, &connection_id, event).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => dispatch(&state, &connection_id, Ok(event)).await,
                                Ok(None) => break,
                                Err(e) => {
                                    // Framing is lost; drop whatever is buffered.
                                    read_buffer.clear();
                                    dispatch(&state, &connection_id, Err(e.into())).await;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.disconnect(&connection_id);
    metrics::record_hub_stats(&state.hub.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Hand one decoded (or undecodable) event to the hub.
///
/// Failures are reported to this connection only, as an `error` event.
async fn dispatch(
    state: &AppState,
    connection_id: &ConnectionId,
    event: Result<ClientEvent, SyncError>,
) {
    let start = Instant::now();

    let result = match event {
        Ok(event) => {
            let name = event.name();
            let is_join = matches!(event, ClientEvent::Join(_));
            let is_change = matches!(event, ClientEvent::Change(_));
            debug!(connection = %connection_id, event = name, "Inbound event");

            let result = state.hub.handle(connection_id, event).await;
            if result.is_ok() {
                if is_join {
                    metrics::record_join();
                } else if is_change {
                    metrics::record_change();
                }
            }
            result
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        match e {
            SyncError::NotRegistered(_) => {
                // Evicted mid-dispatch; the closed queue ends the loop.
                return;
            }
            SyncError::MalformedMessage(_) => {
                warn!(connection = %connection_id, error = %e, "Malformed message");
                metrics::record_error("malformed");
            }
            _ => {
                debug!(connection = %connection_id, error = %e, "Event rejected");
                metrics::record_error("rejected");
            }
        }

        let notice = Arc::new(ServerEvent::error(e.code(), e.to_string()));
        if let Err(e) = state.hub.registry().send_to(connection_id, notice) {
            debug!(connection = %connection_id, error = %e, "Could not report error");
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::record_hub_stats(&state.hub.stats());
}

/// Send an event to the WebSocket in the connection's encoding.
async fn send_event(sender: &mut WsSender, event: &ServerEvent, encoding: Encoding) -> Result<()> {
    let message = match encoding {
        Encoding::Json => Message::Text(codec::encode_json(event)?),
        Encoding::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };

    metrics::record_message(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
