//! Liveness and readiness endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::router::GatewayState;

/// `GET /healthz` — always 200, no dependencies. Safe as a container
/// liveness probe: it never blocks and never reflects node health.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// `GET /health` — gateway-level readiness: uptime plus a per-node health
/// summary. Reports `"degraded"` when any *enabled* node is unhealthy, but
/// still answers 200 so it can't take the whole gateway out of a load
/// balancer's rotation over a single bad node.
pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let mut nodes = Vec::with_capacity(snapshot.nodes.len());
    let mut degraded = false;

    for node in &snapshot.nodes {
        let live = state.registry.read(&node.name).await.unwrap_or_default();
        if node.enabled && !live.is_healthy {
            degraded = true;
        }
        nodes.push(json!({
            "name": node.name,
            "enabled": node.enabled,
            "is_healthy": live.is_healthy,
        }));
    }

    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "nodes": nodes,
    }))
}
