//! Bearer-token authentication middleware for the mutating config routes.
//!
//! When `GATEWAY_ADMIN_TOKEN` is set, `POST /api/config` and
//! `POST /api/config/reload` require an `Authorization: Bearer <token>`
//! header. Requests with a missing or incorrect token are rejected with
//! `401 Unauthorized`.
//!
//! When the env var is unset the middleware is a no-op — admin auth is
//! disabled, matching the original gateway's default of no config-mutation
//! auth.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::router::GatewayState;

/// Axum middleware: requires a valid `Authorization: Bearer <token>` header
/// on config-mutation routes when `state.admin_token` is set.
pub async fn admin_auth_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.admin_token else {
        // Auth disabled — pass through.
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected.as_str() => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"model-gateway admin\"")],
            "Invalid admin token.",
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"model-gateway admin\"")],
            "Config endpoint requires Authorization: Bearer <token>.",
        )
            .into_response(),
    }
}
