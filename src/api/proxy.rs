//! The client-facing proxy surface: everything that isn't one of the
//! gateway's own introspection/admin routes falls through to here.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse};

use crate::router::{dispatch, GatewayState};

/// `GET /` — identifies the gateway without routing anywhere, matching
/// Ollama's own root response so existing health-checking scripts that poll
/// `/` keep working against the gateway too.
pub async fn root() -> impl IntoResponse {
    "model-gateway is running"
}

/// Catch-all fallback: every path not claimed by an explicit route in
/// `main.rs`'s route table lands here and is proxied to a selected node.
pub async fn proxy_handler(State(state): State<Arc<GatewayState>>, req: axum::extract::Request) -> impl IntoResponse {
    dispatch(state, req).await
}
