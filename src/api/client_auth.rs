//! Optional bearer-token authentication in front of the proxy path.
//!
//! When `GATEWAY_CLIENT_TOKENS` is set (comma-separated), every proxied
//! request must carry an `Authorization: Bearer <token>` header matching one
//! of the configured tokens. This is ambient hardening, off by default —
//! unlike [`crate::api::admin_auth`] it has no notion of a resolved
//! "profile"; a token is either accepted or it isn't.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::router::GatewayState;

/// Axum middleware: requires a valid `Authorization: Bearer <token>` header
/// when `state.client_tokens` is configured. No-ops otherwise.
pub async fn client_auth_middleware(State(state): State<Arc<GatewayState>>, req: Request, next: Next) -> Response {
    let Some(tokens) = &state.client_tokens else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if tokens.contains(token) => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"model-gateway\"")],
            "Missing or invalid bearer token.",
        )
            .into_response(),
    }
}
