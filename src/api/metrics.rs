//! `GET /metrics` — Prometheus text exposition combining the cumulative
//! request/duration counters from [`crate::metrics::Metrics`] with live
//! per-node gauges read straight off the node registry.

use std::sync::Arc;

use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse};

use crate::router::GatewayState;

pub async fn metrics(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let mut out = state.metrics.render();

    out.push_str("# HELP gateway_active_connections In-flight requests currently dispatched to a node\n");
    out.push_str("# TYPE gateway_active_connections gauge\n");
    out.push_str("# HELP gateway_node_health Node health as last observed by the reconciler (1 healthy, 0 unhealthy)\n");
    out.push_str("# TYPE gateway_node_health gauge\n");

    for (name, live) in state.registry.snapshot_all().await {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        out.push_str(&format!("gateway_active_connections{{node=\"{escaped}\"}} {}\n", live.active_connections));
        out.push_str(&format!(
            "gateway_node_health{{node=\"{escaped}\"}} {}\n",
            if live.is_healthy { 1 } else { 0 }
        ));
    }

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}
