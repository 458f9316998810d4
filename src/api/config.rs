//! `/api/config` get/replace and the explicit `/api/config/reload` route.
//!
//! Mutating routes (`POST /api/config`, `POST /api/config/reload`) sit
//! behind [`crate::api::admin_auth`] when `GATEWAY_ADMIN_TOKEN` is set.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::{error::GatewayError, router::GatewayState};

/// `GET /api/config` — the raw (uninterpolated) on-disk document. Secrets
/// are resolved only once the document is parsed into a [`crate::config::RoutingSnapshot`]
/// in memory, so the stored `${VAR}` references are returned verbatim here
/// rather than the resolved values.
pub async fn get_config(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.raw_config())
}

/// `POST /api/config` — validates, backs up the previous file, writes the
/// new document, and reloads the live snapshot from it. Rejects (without
/// touching disk) if the document doesn't parse into the expected shape.
pub async fn replace_config(
    State(state): State<Arc<GatewayState>>,
    Json(doc): Json<Value>,
) -> Result<impl IntoResponse, GatewayError> {
    state.save(&doc).await.map_err(|e| GatewayError::ConfigInvalid(e.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}

/// `POST /api/config/reload` — re-reads the already-written file from disk
/// without requiring a new body, for operators who edited the file directly.
pub async fn reload_config(State(state): State<Arc<GatewayState>>) -> Result<impl IntoResponse, GatewayError> {
    state.reload().await.map_err(|e| GatewayError::ConfigInvalid(e.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}
