//! Routing introspection: `/api/routing/query` previews a scheduling
//! decision without dispatching a request; `/api/routing/rules` exposes the
//! live size-resolution and strategy configuration.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{model_size, router::GatewayState, scheduler};

#[derive(Deserialize)]
pub struct RoutingQuery {
    model_name: String,
}

/// `GET /api/routing/query?model_name=...` — resolves size, builds the
/// candidate set, and reports which node *would* be selected right now,
/// without making any upstream call or touching scheduler state.
pub async fn routing_query(State(state): State<Arc<GatewayState>>, Query(q): Query<RoutingQuery>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let base_name = q
        .model_name
        .split_once(':')
        .map(|(base, _)| base.to_string())
        .unwrap_or_else(|| q.model_name.clone());
    let size_b = model_size::resolve_size(&base_name, Some(&q.model_name), &snapshot.size_rules);

    let candidates = scheduler::candidates(&snapshot.nodes, &state.registry, Some(&base_name), Some(size_b)).await;
    let candidate_names: Vec<&str> = candidates.iter().map(|c| c.config.name.as_str()).collect();

    Json(json!({
        "model_name": q.model_name,
        "base_name": base_name,
        "resolved_size_b": size_b,
        "candidates": candidate_names,
        "strategy": snapshot.strategy,
    }))
}

/// `GET /api/routing/rules` — the live size-resolution table, strategy, and
/// per-node model inventory, for operators diagnosing a routing decision.
pub async fn routing_rules(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let mut nodes = Vec::with_capacity(snapshot.nodes.len());
    for node in &snapshot.nodes {
        let live = state.registry.read(&node.name).await.unwrap_or_default();
        nodes.push(json!({
            "name": node.name,
            "enabled": node.enabled,
            "is_healthy": live.is_healthy,
            "models": live.models.iter().collect::<Vec<_>>(),
            "supported_model_ranges": node.supported_model_ranges,
        }));
    }

    Json(json!({
        "strategy": snapshot.strategy,
        "default_size_b": snapshot.size_rules.default_size_b,
        "model_name_patterns": snapshot.size_rules.patterns,
        "model_name_mapping": snapshot.size_rules.mapping,
        "nodes": nodes,
    }))
}
