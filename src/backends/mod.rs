//! Upstream HTTP client for talking to a selected node.
//!
//! Every node — local Ollama instance or external cloud provider — speaks
//! the same Ollama-compatible wire protocol, so there is a single client
//! type rather than per-provider adapters. `UpstreamClient` keeps two
//! `reqwest::Client`s: one carries the dispatch-path timeout on every call,
//! the other has none, because a streaming response's own EOF is the only
//! thing that should end it.

use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use reqwest::{Client, Method, StatusCode};
use std::pin::Pin;

/// A `Send`-able, heap-allocated byte stream used for SSE passthrough.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// The outcome of proxying one request to an upstream node: either the
/// whole body was buffered, or it's being streamed through.
pub enum UpstreamResponse {
    Buffered {
        status: StatusCode,
        headers: HashMap<String, String>,
        body: Bytes,
    },
    Streaming {
        status: StatusCode,
        headers: HashMap<String, String>,
        body: SseStream,
    },
}

/// Response headers that must never be forwarded from upstream to the
/// client, ported from `proxy_request`'s response header filtering (the
/// `hop-by-hop` family plus length/framing headers the proxy itself owns).
const RESPONSE_HEADER_DENYLIST: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

pub struct UpstreamClient {
    /// Buffered requests — has the dispatch-path timeout (default 300s,
    /// overridable per external node).
    client: Client,
    /// Streaming requests — no per-request timeout; the stream ends when
    /// the upstream closes the connection.
    stream_client: Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            stream_client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build streaming reqwest client"),
        }
    }

    /// `GET {base}/api/tags` with a 5s timeout, used by the reconciler and
    /// by `/nodes/{name}/tags`.
    pub async fn tags(&self, base_url: &str, headers: &HashMap<String, String>) -> anyhow::Result<serde_json::Value> {
        let url = format!("{base_url}/api/tags");
        let mut req = self.client.get(&url).timeout(Duration::from_secs(5));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        let text = resp.text().await.context("reading /api/tags body")?;
        if !status.is_success() {
            anyhow::bail!("upstream returned HTTP {status} for /api/tags: {text}");
        }
        serde_json::from_str(&text).with_context(|| format!("parsing /api/tags response: {text}"))
    }

    /// `GET {base}/api/ps`, tolerating a 404 as "endpoint not supported"
    /// (external providers routinely lack this Ollama-specific endpoint).
    pub async fn ps(
        &self,
        base_url: &str,
        headers: &HashMap<String, String>,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let url = format!("{base_url}/api/ps");
        let mut req = self.client.get(&url).timeout(Duration::from_secs(5));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        let text = resp.text().await.context("reading /api/ps body")?;
        if !status.is_success() {
            anyhow::bail!("upstream returned HTTP {status} for /api/ps: {text}");
        }
        Ok(Some(serde_json::from_str(&text).with_context(|| {
            format!("parsing /api/ps response: {text}")
        })?))
    }

    /// Proxies one request verbatim to `{base_url}{path}`. `headers` are
    /// already filtered/merged by the caller (see `router::dispatch`);
    /// this method only strips the forbidden response headers before
    /// handing the result back. Streaming responses (`content-type`
    /// containing `text/event-stream`) are detected by substring, matching
    /// the original's check, and returned unbuffered.
    pub async fn proxy(
        &self,
        base_url: &str,
        path: &str,
        method: Method,
        headers: HashMap<String, String>,
        body: Bytes,
        timeout: Duration,
    ) -> anyhow::Result<UpstreamResponse> {
        let url = format!("{base_url}{path}");

        // We don't know ahead of time whether the response will be an SSE
        // stream, so every request goes through the no-default-timeout
        // client with an explicit per-call timeout layered on top; once
        // headers arrive we decide whether to buffer or stream the body,
        // mirroring the original reading `content-type` only at that point.
        let mut req = self.stream_client.request(method, &url).timeout(timeout);
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req.send().await.context("sending upstream request")?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let response_headers = filter_response_headers(resp.headers());

        if content_type.contains("text/event-stream") {
            let stream = resp.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
            Ok(UpstreamResponse::Streaming {
                status,
                headers: response_headers,
                body: Box::pin(stream),
            })
        } else {
            let bytes = resp.bytes().await.context("reading upstream response body")?;
            Ok(UpstreamResponse::Buffered {
                status,
                headers: response_headers,
                body: bytes,
            })
        }
    }
}

fn filter_response_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !RESPONSE_HEADER_DENYLIST.contains(&name.as_str().to_lowercase().as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}
