#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod gateway;
pub mod protocol;

pub use gateway::{PeerContext, SignalingGateway};

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    gateway: SignalingGateway,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    idle_timeout: Duration,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(gateway: SignalingGateway, metrics: ServerMetrics, config: &ServerConfig) -> Self {
        info!("Max connections: {}", config.max_connections);
        if config.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is public");
        }

        Self {
            gateway,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            idle_timeout: config.idle_timeout,
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.gateway.registry();
    let status = if registry.is_available() { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "engine": registry.engine().name(),
        "rooms": registry.room_count(),
        "peers": registry.peer_count(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Bearer-protected when METRICS_TOKEN is configured.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.gateway.registry();
    let body = server
        .metrics
        .render_prometheus(registry.room_count(), registry.peer_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.gateway,
                server.metrics,
                server.idle_timeout,
                permit,
            )
        })
}
