//! Gateway state and the request dispatcher.
//!
//! [`GatewayState`] holds everything a handler needs: the hot-swappable
//! [`RoutingSnapshot`], the node registry, the upstream HTTP client,
//! cumulative metrics, the recent-traffic ring buffer, and the ambient
//! hardening knobs (admin token, client tokens, rate limiter). [`dispatch`]
//! is the proxy path itself — model extraction, size resolution, candidate
//! selection, the upstream call, and the accounting that must happen
//! exactly once per request regardless of how it ends.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::Request,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde_json::Value;

use crate::{
    backends::{SseStream, UpstreamClient, UpstreamResponse},
    config::{ConfigStore, NodeConfig, NodeKind, RoutingSnapshot},
    error::GatewayError,
    metrics::{Metrics, RequestLabels},
    model_size,
    node::NodeRegistry,
    reconciler, scheduler,
    scheduler::Scheduler,
    traffic::{TrafficEntry, TrafficLog},
};

/// Hop-by-hop / framing headers never forwarded from the client to upstream.
const REQUEST_HEADER_DENYLIST: &[&str] = &["host", "content-length", "connection", "keep-alive", "transfer-encoding"];

/// Default total timeout for a dispatched request when the node doesn't
/// configure its own (external nodes may override via `timeout_seconds`).
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Cap on a buffered (non-streaming) request body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Shared, `Arc`-wrapped application state threaded through every handler.
pub struct GatewayState {
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    raw_config: RwLock<Value>,
    pub config_store: ConfigStore,
    pub registry: Arc<NodeRegistry>,
    pub upstream: UpstreamClient,
    pub metrics: Metrics,
    pub traffic: Arc<TrafficLog>,
    pub started_at: Instant,
    /// `GATEWAY_ADMIN_TOKEN` — gates `POST /api/config` and `/api/config/reload`.
    pub admin_token: Option<String>,
    /// `GATEWAY_CLIENT_TOKENS` (comma-separated) — gates the proxy path only.
    pub client_tokens: Option<std::collections::HashSet<String>>,
    pub rate_limiter: Option<Arc<crate::api::rate_limit::RateLimiter>>,
}

impl GatewayState {
    pub fn new(
        config_store: ConfigStore,
        snapshot: RoutingSnapshot,
        raw_config: Value,
        registry: Arc<NodeRegistry>,
        traffic_capacity: usize,
    ) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            raw_config: RwLock::new(raw_config),
            config_store,
            registry,
            upstream: UpstreamClient::new(),
            metrics: Metrics::new(),
            traffic: Arc::new(TrafficLog::new(traffic_capacity)),
            started_at: Instant::now(),
            admin_token: std::env::var("GATEWAY_ADMIN_TOKEN").ok(),
            client_tokens: std::env::var("GATEWAY_CLIENT_TOKENS").ok().map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }),
            rate_limiter: std::env::var("GATEWAY_RATE_LIMIT_RPM")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .map(|rpm| Arc::new(crate::api::rate_limit::RateLimiter::new(rpm))),
        }
    }

    /// Cheap clone of the currently published routing snapshot.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    pub fn raw_config(&self) -> Value {
        self.raw_config.read().unwrap().clone()
    }

    /// Re-reads the config file from disk and atomically swaps in the new
    /// snapshot. The node registry is reconciled against the new node list
    /// before the swap is published, so no reader ever observes a snapshot
    /// whose nodes the registry hasn't caught up with.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let (snapshot, raw) = self.config_store.load()?;
        self.registry.reconcile(&snapshot.nodes).await;
        *self.snapshot.write().unwrap() = Arc::new(snapshot);
        *self.raw_config.write().unwrap() = raw;
        Ok(())
    }

    /// Validates, backs up, and writes `doc` to disk, then reloads from it.
    pub async fn save(&self, doc: &Value) -> anyhow::Result<()> {
        let (snapshot, raw) = self.config_store.save(doc)?;
        self.registry.reconcile(&snapshot.nodes).await;
        *self.snapshot.write().unwrap() = Arc::new(snapshot);
        *self.raw_config.write().unwrap() = raw;
        Ok(())
    }
}

/// Builds the `Authorization`/extra headers a node's own config contributes,
/// e.g. an external provider's API key or custom headers. Shared by the
/// dispatcher, the aggregator, and `/nodes/{name}/tags`.
pub fn node_auth_headers(node: &NodeConfig) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let NodeKind::External { headers: cfg_headers, api_key, .. } = &node.kind {
        headers.extend(cfg_headers.clone());
        if let Some(key) = api_key {
            headers
                .entry("Authorization".to_string())
                .or_insert_with(|| format!("Bearer {key}"));
        }
    }
    headers
}

fn node_timeout(node: &NodeConfig) -> Duration {
    match &node.kind {
        NodeKind::External { timeout_seconds: Some(secs), .. } => Duration::from_secs_f64(*secs),
        _ => DEFAULT_UPSTREAM_TIMEOUT,
    }
}

/// Finds `key`'s first value in a raw (un-decoded) query string.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn cors_preflight_response() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "*")
        .header("access-control-allow-headers", "*")
        .body(Body::empty())
        .expect("static response is well-formed")
}

/// Bookkeeping that must happen exactly once per dispatched request,
/// regardless of whether the response finished normally, errored, or the
/// client disconnected mid-stream. For a buffered response it's dropped
/// immediately after the body is built; for a streaming response it rides
/// inside [`GuardedStream`] so a cancelled client still triggers `Drop`.
struct DispatchGuard {
    state: Arc<GatewayState>,
    node: String,
    labels: RequestLabels,
    started: Instant,
    status: String,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.state.registry.dec_active(&self.node);
        let elapsed = self.started.elapsed().as_secs_f64();
        self.state.metrics.observe_duration(&self.labels, elapsed);
        self.state.metrics.record_request(&self.labels, &self.status);
    }
}

/// Wraps an [`SseStream`] together with the guard that must outlive it:
/// `active_connections` is released and request/duration metrics are
/// recorded when this is dropped, whether the stream ran to completion or
/// the client disconnected early.
struct GuardedStream {
    inner: SseStream,
    _guard: DispatchGuard,
}

impl Stream for GuardedStream {
    type Item = anyhow::Result<Bytes>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

/// The proxy dispatcher: spec-equivalent of the original gateway's
/// `proxy_request`, generalized from a single upstream to a pool of nodes
/// selected per request.
pub async fn dispatch(state: Arc<GatewayState>, req: Request) -> Response {
    if req.method() == Method::OPTIONS {
        return cors_preflight_response();
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();
    let headers = req.headers().clone();

    let body_bytes: Bytes = if method == Method::POST {
        match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
            Ok(b) => b,
            Err(e) => return GatewayError::Internal(anyhow::anyhow!("reading request body: {e}")).into_response(),
        }
    } else {
        Bytes::new()
    };

    let full_name = query_param(&query, "model").map(str::to_string).or_else(|| {
        serde_json::from_slice::<Value>(&body_bytes)
            .ok()
            .and_then(|v| v.get("model").and_then(Value::as_str).map(String::from))
    });
    let base_name = full_name
        .as_deref()
        .map(|full| full.split_once(':').map(|(base, _)| base.to_string()).unwrap_or_else(|| full.to_string()));

    let snapshot = state.snapshot();
    let size_b = base_name
        .as_deref()
        .map(|base| model_size::resolve_size(base, full_name.as_deref(), &snapshot.size_rules));

    let candidates = scheduler::candidates(&snapshot.nodes, &state.registry, base_name.as_deref(), size_b).await;
    let chosen = Scheduler::new(snapshot.strategy).select(&candidates, &state.registry).await;

    let Some(node) = chosen else {
        return GatewayError::NoHealthyNodes.into_response();
    };
    let node = node.clone();

    let mut fwd_headers: HashMap<String, String> = headers
        .iter()
        .filter(|(name, _)| !REQUEST_HEADER_DENYLIST.contains(&name.as_str().to_lowercase().as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    for (k, v) in node_auth_headers(&node) {
        fwd_headers.insert(k, v);
    }

    let full_path = if query.is_empty() { path.clone() } else { format!("{path}?{query}") };
    let timeout = node_timeout(&node);
    let labels = RequestLabels { method: method.to_string(), endpoint: path.clone(), node: node.name.clone() };

    state.registry.inc_active(&node.name);
    let started = Instant::now();

    let result = state
        .upstream
        .proxy(&node.base_url(), &full_path, method.clone(), fwd_headers, body_bytes, timeout)
        .await;

    match result {
        Ok(UpstreamResponse::Buffered { status, headers: resp_headers, body }) => {
            state.registry.record_request(&node.name).await;
            state.traffic.push(
                TrafficEntry::new(node.name.clone(), started.elapsed().as_millis() as u64, true)
                    .with_requested_model(full_name.as_deref().unwrap_or("")),
            );
            drop(DispatchGuard {
                state: Arc::clone(&state),
                node: node.name.clone(),
                labels,
                started,
                status: status.as_u16().to_string(),
            });

            build_buffered_response(status, resp_headers, body)
        }
        Ok(UpstreamResponse::Streaming { status, headers: resp_headers, body }) => {
            state.registry.record_request(&node.name).await;
            state.traffic.push(
                TrafficEntry::new(node.name.clone(), started.elapsed().as_millis() as u64, true)
                    .with_requested_model(full_name.as_deref().unwrap_or("")),
            );

            let guard = DispatchGuard {
                state: Arc::clone(&state),
                node: node.name.clone(),
                labels,
                started,
                status: status.as_u16().to_string(),
            };
            let guarded = GuardedStream { inner: body, _guard: guard };
            build_streaming_response(status, resp_headers, guarded)
        }
        Err(e) => {
            let is_timeout = e.downcast_ref::<reqwest::Error>().map(|e| e.is_timeout()).unwrap_or(false);
            state.registry.record_request(&node.name).await;
            state.registry.record_failure(&node.name).await;
            state.traffic.push(
                TrafficEntry::new(node.name.clone(), started.elapsed().as_millis() as u64, false)
                    .with_requested_model(full_name.as_deref().unwrap_or(""))
                    .with_error(&e.to_string()),
            );

            let status_label = if is_timeout { "timeout" } else { "error" };
            drop(DispatchGuard {
                state: Arc::clone(&state),
                node: node.name.clone(),
                labels,
                started,
                status: status_label.to_string(),
            });

            if is_timeout {
                GatewayError::UpstreamTimeout { node: node.name.clone() }.into_response()
            } else {
                GatewayError::UpstreamTransport { node: node.name.clone(), source: e }.into_response()
            }
        }
    }
}

fn build_buffered_response(status: StatusCode, headers: HashMap<String, String>, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers {
        builder = builder.header(k, v);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn build_streaming_response(status: StatusCode, headers: HashMap<String, String>, stream: GuardedStream) -> Response {
    let body_stream = stream.map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut builder = Response::builder().status(status);
    for (k, v) in headers {
        builder = builder.header(k, v);
    }
    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Spawns the background 30s reconciliation loop. Reads the live snapshot
/// off `state` on every tick rather than a frozen copy, so a reload that
/// adds or removes nodes takes effect on the very next probe pass.
pub fn spawn_reconciler(state: Arc<GatewayState>) -> tokio::task::JoinHandle<()> {
    let client = reqwest::Client::new();
    let registry = Arc::clone(&state.registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let nodes = state.snapshot().nodes.clone();
            reconciler::probe_all(&client, &registry, &nodes).await;
        }
    })
}

pub const RESERVED_EXACT_PATHS: &[&str] = &[
    "/", "/health", "/healthz", "/metrics", "/api/nodes", "/api/tags", "/api/config", "/api/config/reload",
    "/api/routing/query", "/api/routing/rules", "/nodes/ps", "/debug/config",
];

/// `true` if `path` is one of the gateway's own introspection/admin routes
/// rather than a model path that should fall through to [`dispatch`].
/// `/nodes/{name}/tags` is matched by prefix since the name is a path
/// parameter.
pub fn is_reserved_path(path: &str) -> bool {
    RESERVED_EXACT_PATHS.contains(&path) || (path.starts_with("/nodes/") && path.ends_with("/tags"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_key_among_several() {
        assert_eq!(query_param("a=1&model=llama3&b=2", "model"), Some("llama3"));
    }

    #[test]
    fn query_param_absent_returns_none() {
        assert_eq!(query_param("a=1&b=2", "model"), None);
    }

    #[test]
    fn reserved_paths_cover_the_introspection_surface() {
        assert!(is_reserved_path("/health"));
        assert!(is_reserved_path("/api/config"));
        assert!(is_reserved_path("/nodes/gpu-1/tags"));
        assert!(!is_reserved_path("/api/generate"));
        assert!(!is_reserved_path("/v1/chat/completions"));
    }

    // -----------------------------------------------------------------------
    // dispatch() — end-to-end against mock backends
    // -----------------------------------------------------------------------

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::{ModelSizeRules, NodeKind, SchedulingStrategy};

    fn external_node(name: &str, base_url: String) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            kind: NodeKind::External {
                api_url: base_url,
                api_key: None,
                headers: HashMap::new(),
                timeout_seconds: None,
            },
            weight: 1.0,
            enabled: true,
            supported_model_ranges: Vec::new(),
        }
    }

    /// Builds a `GatewayState` with a single node already marked healthy and
    /// hosting `model`, pointed at `server`.
    async fn state_with_one_healthy_node(server: &MockServer, model: &str) -> Arc<GatewayState> {
        let node = external_node("mock", server.uri());
        let registry = Arc::new(NodeRegistry::new());
        registry.reconcile(std::slice::from_ref(&node)).await;
        registry.set_health("mock", true).await;
        registry.set_models("mock", std::collections::HashSet::from([model.to_string()])).await;

        let snapshot = RoutingSnapshot {
            nodes: vec![node],
            size_rules: ModelSizeRules::default(),
            strategy: SchedulingStrategy::RoundRobin,
        };
        let config_store = ConfigStore::new(std::path::PathBuf::from("/tmp/model-gateway-test-unused.json"));
        Arc::new(GatewayState::new(config_store, snapshot, serde_json::json!({}), registry, 100))
    }

    fn request(method: Method, uri: &str, body: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn dispatch_proxies_a_successful_request_to_the_selected_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "hello"})))
            .mount(&server)
            .await;

        let state = state_with_one_healthy_node(&server, "llama3").await;
        let req = request(Method::POST, "/api/generate", r#"{"model":"llama3"}"#);

        let resp = dispatch(state, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["response"], "hello");
    }

    #[tokio::test]
    async fn dispatch_returns_503_when_no_healthy_nodes() {
        let registry = Arc::new(NodeRegistry::new());
        let snapshot = RoutingSnapshot {
            nodes: Vec::new(),
            size_rules: ModelSizeRules::default(),
            strategy: SchedulingStrategy::RoundRobin,
        };
        let config_store = ConfigStore::new(std::path::PathBuf::from("/tmp/model-gateway-test-unused.json"));
        let state = Arc::new(GatewayState::new(config_store, snapshot, serde_json::json!({}), registry, 100));

        let req = request(Method::POST, "/api/generate", r#"{"model":"anything"}"#);
        let resp = dispatch(state, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("no healthy nodes"));
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_permissive_set_for_an_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "ok"})))
            .mount(&server)
            .await;

        // Node only advertises "llama3"; request asks for a model nobody lists.
        let state = state_with_one_healthy_node(&server, "llama3").await;
        let req = request(Method::POST, "/api/generate", r#"{"model":"brand-new-model"}"#);

        let resp = dispatch(state, req).await;
        assert_eq!(resp.status(), StatusCode::OK, "permissive fallback must still land on the one healthy node");
    }

    #[tokio::test]
    async fn dispatch_streams_event_stream_responses_through_unbuffered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("data: a\n\ndata: b\n\ndata: c\n\n", "text/event-stream"))
            .mount(&server)
            .await;

        let state = state_with_one_healthy_node(&server, "llama3").await;
        let req = request(Method::POST, "/api/chat", r#"{"model":"llama3"}"#);

        let resp = dispatch(state, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"data: a\n\ndata: b\n\ndata: c\n\n");
    }

    #[tokio::test]
    async fn dispatch_maps_upstream_timeout_to_504_and_still_releases_the_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let node = NodeConfig {
            name: "mock".to_string(),
            kind: NodeKind::External {
                api_url: server.uri(),
                api_key: None,
                headers: HashMap::new(),
                // Shorter than the mock's artificial delay so the call times out.
                timeout_seconds: Some(0.05),
            },
            weight: 1.0,
            enabled: true,
            supported_model_ranges: Vec::new(),
        };
        let registry = Arc::new(NodeRegistry::new());
        registry.reconcile(std::slice::from_ref(&node)).await;
        registry.set_health("mock", true).await;
        registry.set_models("mock", std::collections::HashSet::from(["llama3".to_string()])).await;

        let snapshot = RoutingSnapshot {
            nodes: vec![node],
            size_rules: ModelSizeRules::default(),
            strategy: SchedulingStrategy::RoundRobin,
        };
        let config_store = ConfigStore::new(std::path::PathBuf::from("/tmp/model-gateway-test-unused.json"));
        let state = Arc::new(GatewayState::new(config_store, snapshot, serde_json::json!({}), registry.clone(), 100));

        let req = request(Method::POST, "/api/generate", r#"{"model":"llama3"}"#);
        let resp = dispatch(state, req).await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(registry.read("mock").await.unwrap().active_connections, 0, "timeout must still release the active-connection slot");
    }
}
