use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{server::ServerState, utils::error::WebSocketError};

/// Server-wide Prometheus metrics.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Currently open WebSocket connections.
    pub connections: IntGauge,
    /// Connections accepted since start.
    pub connections_total: IntCounter,
    /// Connections refused by admission control or the handshake policy.
    pub rejected_connections: IntCounter,
    pub messages_received: IntCounter,
    pub messages_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,
    pub errors: IntCounter,
    pub rooms: IntGauge,
    registry: Registry,
}

impl HealthMetrics {
    /// Creates the metrics and registers them with a private registry.
    pub fn new() -> Result<Self, WebSocketError> {
        let registry = Registry::new();

        let connections = IntGauge::new("ws_connections", "Active connections")?;
        let connections_total =
            IntCounter::new("ws_connections_total", "Total accepted connections")?;
        let rejected_connections =
            IntCounter::new("ws_rejected_connections_total", "Total rejected connections")?;
        let messages_received =
            IntCounter::new("ws_messages_received_total", "Total messages received")?;
        let messages_sent = IntCounter::new("ws_messages_sent_total", "Total messages sent")?;
        let bytes_received = IntCounter::new("ws_bytes_received_total", "Total bytes received")?;
        let bytes_sent = IntCounter::new("ws_bytes_sent_total", "Total bytes sent")?;
        let errors = IntCounter::new("ws_errors_total", "Total connection errors")?;
        let rooms = IntGauge::new("ws_rooms", "Active rooms")?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(rejected_connections.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(rooms.clone()))?;

        Ok(Self {
            connections,
            connections_total,
            rejected_connections,
            messages_received,
            messages_sent,
            bytes_received,
            bytes_sent,
            errors,
            rooms,
            registry,
        })
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn expose_metrics(&self) -> Result<String, WebSocketError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| WebSocketError::SerializationError(e.to_string()))
    }

    pub fn snapshot(&self) -> ServerMetrics {
        ServerMetrics {
            active_connections: self.connections.get().max(0) as u64,
            total_connections: self.connections_total.get(),
            rejected_connections: self.rejected_connections.get(),
            messages_received: self.messages_received.get(),
            messages_sent: self.messages_sent.get(),
            bytes_received: self.bytes_received.get(),
            bytes_sent: self.bytes_sent.get(),
            errors: self.errors.get(),
            rooms: self.rooms.get().max(0) as u64,
        }
    }
}

/// Point-in-time copy of the server counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMetrics {
    pub active_connections: u64,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub rooms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub checks: BTreeMap<String, String>,
    pub uptime_secs: u64,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthLevel::Healthy
    }
}

/// Derives health from the hub state and connection capacity.
///
/// More than 90% of `max_connections` in use is reported as degraded; a stopped
/// hub is unhealthy.
pub fn evaluate_health(state: &ServerState) -> HealthStatus {
    let mut checks = BTreeMap::new();
    let mut status = HealthLevel::Healthy;

    let hub_running = state.hub.is_running();
    checks.insert(
        "hub".to_owned(),
        if hub_running { "running" } else { "stopped" }.to_owned(),
    );
    if !hub_running {
        status = HealthLevel::Unhealthy;
    }

    let connections = state.hub.client_count();
    let max = state.config.max_connections;
    checks.insert("connections".to_owned(), format!("{connections}/{max}"));
    if status == HealthLevel::Healthy && max > 0 && connections * 10 > max * 9 {
        status = HealthLevel::Degraded;
    }
    checks.insert("rooms".to_owned(), state.hub.room_count().to_string());

    HealthStatus {
        status,
        checks,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }
}

/// Serves `/metrics` and `/health` until `shutdown` fires.
pub async fn serve_metrics_http(state: Arc<ServerState>, addr: SocketAddr, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let server = match axum::Server::try_bind(&addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind metrics endpoint");
            return;
        }
    };
    info!(%addr, "metrics endpoint listening");

    if let Err(e) = server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!(error = %e, "metrics endpoint failed");
    }
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.metrics.rooms.set(state.hub.room_count() as i64);
    match state.metrics.expose_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let health = evaluate_health(&state);
    let code = match health.status {
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_and_snapshot() {
        let metrics = HealthMetrics::new().unwrap();
        metrics.connections.inc();
        metrics.messages_received.inc_by(3);
        metrics.bytes_sent.inc_by(42);

        let text = metrics.expose_metrics().unwrap();
        assert!(text.contains("ws_connections 1"));
        assert!(text.contains("ws_messages_received_total 3"));

        let snap = metrics.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.bytes_sent, 42);
    }

    #[test]
    fn health_levels_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthLevel::Degraded).unwrap(),
            "\"degraded\""
        );
    }
}
