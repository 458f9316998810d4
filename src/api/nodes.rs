//! Node introspection: `/api/nodes`, `/nodes/{name}/tags`, `/nodes/ps`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    error::GatewayError,
    router::{node_auth_headers, GatewayState},
};

/// `GET /api/nodes` — every configured node plus its live state.
pub async fn list_nodes(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let mut nodes = Vec::with_capacity(snapshot.nodes.len());
    for node in &snapshot.nodes {
        let live = state.registry.read(&node.name).await.unwrap_or_default();
        nodes.push(json!({
            "name": node.name,
            "kind": match &node.kind {
                crate::config::NodeKind::Local { .. } => "local",
                crate::config::NodeKind::External { .. } => "external",
            },
            "base_url": node.base_url(),
            "enabled": node.enabled,
            "weight": node.effective_weight(),
            "supported_model_ranges": node.supported_model_ranges,
            "is_healthy": live.is_healthy,
            "active_connections": live.active_connections,
            "total_requests": live.total_requests,
            "failed_requests": live.failed_requests,
            "models": live.models.iter().collect::<Vec<_>>(),
            "last_health_check": live.last_health_check,
            "last_model_sync": live.last_model_sync,
        }));
    }
    Json(json!({ "nodes": nodes }))
}

/// `GET /nodes/{name}/tags` — proxies one node's own `/api/tags`, unmerged.
pub async fn node_tags(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let snapshot = state.snapshot();
    let node = snapshot.nodes.iter().find(|n| n.name == name).ok_or_else(|| GatewayError::NotFound(name.clone()))?;
    if !node.enabled {
        return Err(GatewayError::NodeDisabled(name));
    }
    let headers = node_auth_headers(node);
    let value = state
        .upstream
        .tags(&node.base_url(), &headers)
        .await
        .map_err(|source| GatewayError::UpstreamTransport { node: name.clone(), source })?;
    Ok(Json(value))
}

/// `GET /nodes/ps` — fans `/api/ps` out to every enabled node, tolerating
/// per-node failure or the endpoint being unsupported.
pub async fn nodes_ps(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let mut results = Vec::new();
    for node in snapshot.nodes.iter().filter(|n| n.enabled) {
        let headers = node_auth_headers(node);
        let entry = match state.upstream.ps(&node.base_url(), &headers).await {
            Ok(Some(value)) => json!({ "node": node.name, "status": "ok", "data": value }),
            Ok(None) => json!({ "node": node.name, "status": "unsupported" }),
            Err(err) => json!({ "node": node.name, "status": "error", "error": err.to_string() }),
        };
        results.push(entry);
    }
    Json(json!({ "nodes": results }))
}

/// `GET /debug/config` — the resolved (post-interpolation) routing snapshot,
/// distinct from `/api/config`'s raw-document view.
pub async fn debug_config(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    Json(json!({
        "strategy": snapshot.strategy,
        "default_size_b": snapshot.size_rules.default_size_b,
        "model_name_patterns": snapshot.size_rules.patterns,
        "model_name_mapping": snapshot.size_rules.mapping,
        "nodes": snapshot.nodes,
        "config_path": state.config_store.path(),
    }))
}
