use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::signal;
use tracing::{info, warn};

mod aggregator;
mod api;
mod backends;
mod config;
mod error;
mod metrics;
mod model_size;
mod node;
mod reconciler;
mod router;
mod scheduler;
mod traffic;

use config::ConfigStore;
use node::NodeRegistry;
use router::GatewayState;

/// Traffic-log ring-buffer capacity. Generous enough for a busy gateway's
/// recent-activity view without growing unbounded.
const TRAFFIC_LOG_CAPACITY: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_gateway=info,tower_http=warn".into()),
        )
        .init();

    let project_root = std::env::current_dir().context("resolving current directory")?;
    let config_path = ConfigStore::resolve_path(&project_root);
    let config_store = ConfigStore::new(config_path.clone());

    let (snapshot, raw_config) = config_store.load().with_context(|| {
        format!(
            "failed to load routing config from {} (set NODE_CONFIG_FILE to override)",
            config_path.display()
        )
    })?;

    if snapshot.nodes.is_empty() {
        warn!(path = %config_path.display(), "starting with an empty node list — every request will 503 until the config is populated");
    }

    info!(
        path = %config_path.display(),
        nodes = snapshot.nodes.len(),
        strategy = ?snapshot.strategy,
        "model-gateway starting"
    );

    let registry = Arc::new(NodeRegistry::new());
    registry.reconcile(&snapshot.nodes).await;

    let state = Arc::new(GatewayState::new(
        config_store,
        snapshot,
        raw_config,
        Arc::clone(&registry),
        TRAFFIC_LOG_CAPACITY,
    ));

    // Probe every node once, synchronously, before accepting traffic, so the
    // first request sees real health/inventory rather than every node
    // defaulting to unhealthy.
    info!("running initial health & inventory pass");
    let probe_client = reqwest::Client::new();
    reconciler::probe_all(&probe_client, &registry, &state.snapshot().nodes).await;

    let _reconciler = router::spawn_reconciler(Arc::clone(&state));

    let port: u16 = std::env::var("GATEWAY_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    let app = build_router(Arc::clone(&state));

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Assembles the full route table: reserved exact paths declared first, then
/// the parameterized `/nodes/{name}/tags`, then the catch-all proxy
/// fallback. This mirrors [`router::RESERVED_EXACT_PATHS`]/[`router::is_reserved_path`]
/// — any path added here must stay in sync with that list.
fn build_router(state: Arc<GatewayState>) -> Router {
    let config_routes = Router::new()
        .route("/api/config", get(api::config::get_config).post(api::config::replace_config))
        .route("/api/config/reload", post(api::config::reload_config))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::admin_auth::admin_auth_middleware,
        ));

    let reserved = Router::new()
        .route("/", get(api::proxy::root))
        .route("/health", get(api::health::health))
        .route("/healthz", get(api::health::healthz))
        .route("/metrics", get(api::metrics::metrics))
        .route("/api/nodes", get(api::nodes::list_nodes))
        .route("/api/tags", get(aggregated_tags))
        .route("/api/routing/query", get(api::routing::routing_query))
        .route("/api/routing/rules", get(api::routing::routing_rules))
        .route("/nodes/ps", get(api::nodes::nodes_ps))
        .route("/nodes/{name}/tags", get(api::nodes::node_tags))
        .route("/debug/config", get(api::nodes::debug_config))
        .merge(config_routes);

    let proxied = Router::new()
        .fallback(api::proxy::proxy_handler)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::client_auth::client_auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::rate_limit::rate_limit_middleware,
        ));

    reserved
        .merge(proxied)
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}

/// `GET /api/tags` handler — thin wrapper around [`aggregator::aggregate_tags`],
/// which takes `&GatewayState` rather than an axum extractor directly.
async fn aggregated_tags(axum::extract::State(state): axum::extract::State<Arc<GatewayState>>) -> axum::Json<serde_json::Value> {
    axum::Json(aggregator::aggregate_tags(&state).await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received SIGINT, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
