//! Unified HTTP error type for axum request handlers.
//!
//! [`GatewayError`] carries its own HTTP status per variant (see spec §7's
//! kind → response table) and converts into a JSON body via [`IntoResponse`].
//! Handlers return `Result<T, GatewayError>` and propagate with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The scheduler returned no candidate after the constrained→permissive
    /// fallback — every node is disabled or unhealthy.
    #[error("no healthy nodes available")]
    NoHealthyNodes,

    /// The configured total/connect timeout elapsed before the upstream
    /// responded.
    #[error("request to {node} timed out")]
    UpstreamTimeout { node: String },

    /// Any other upstream failure (connection refused, reset, DNS, TLS).
    #[error("error proxying to {node}: {source}")]
    UpstreamTransport {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// Startup could not find a config file at the resolved path.
    #[error("config file not found at {0}")]
    ConfigMissing(String),

    /// The config file exists but could not be parsed as JSON.
    #[error("config file malformed: {0}")]
    ConfigMalformed(#[source] anyhow::Error),

    /// `POST /api/config` body failed validation (not an object, bad node
    /// definitions, unknown scheduling strategy, ...).
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// `/nodes/{name}/tags` referenced a node absent from the routing
    /// snapshot.
    #[error("node {0} not found")]
    NotFound(String),

    /// `/nodes/{name}/tags` referenced a node that exists but is disabled.
    #[error("node {0} is disabled")]
    NodeDisabled(String),

    /// A catch-all for I/O and other infrastructure errors that don't map to
    /// a specific spec §7 kind (e.g. writing a config backup).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NoHealthyNodes => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            Self::ConfigMissing(_) => StatusCode::NOT_FOUND,
            Self::ConfigMalformed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NodeDisabled(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, "handler error");
        } else {
            tracing::debug!(error = %self, "handler rejected request");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
