//! `/api/tags` fan-out: merges each healthy node's model inventory into one
//! Ollama-shaped response, so a client sees the union of everything the
//! pool can serve without knowing which node holds which model.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::router::{node_auth_headers, GatewayState};

/// Queries `/api/tags` on every enabled, healthy node concurrently and
/// merges the results by model name. The first node to report a model wins
/// that entry's fields; a later duplicate only backfills fields (`size`,
/// `modified_at`, `digest`) the first report left out. A node whose probe
/// fails is logged and simply omitted — the union still succeeds as long as
/// at least one node replied, and even if none did, the result is an empty
/// (not an error) model list.
pub async fn aggregate_tags(state: &GatewayState) -> Value {
    let snapshot = state.snapshot();
    let nodes: Vec<_> = snapshot.nodes.iter().filter(|n| n.enabled).collect();

    let mut healthy = Vec::new();
    for node in nodes {
        if let Some(live) = state.registry.read(&node.name).await {
            if live.is_healthy {
                healthy.push(node);
            }
        }
    }

    let calls = healthy.iter().map(|node| {
        let headers = node_auth_headers(node);
        async move {
            let result = state.upstream.tags(&node.base_url(), &headers).await;
            (node.name.clone(), result)
        }
    });
    let results = futures_util::future::join_all(calls).await;

    let mut merged: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for (node_name, result) in results {
        let value = match result {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(node = %node_name, error = %err, "aggregator: /api/tags probe failed");
                continue;
            }
        };
        let Some(models) = value.get("models").and_then(Value::as_array) else { continue };
        for model in models {
            let Some(name) = model.get("name").and_then(Value::as_str) else { continue };
            let Some(obj) = model.as_object() else { continue };
            let entry = merged.entry(name.to_string()).or_insert_with(|| obj.clone());
            for field in ["size", "modified_at", "digest"] {
                let missing = entry.get(field).map(Value::is_null).unwrap_or(true);
                if missing {
                    if let Some(v) = obj.get(field) {
                        entry.insert(field.to_string(), v.clone());
                    }
                }
            }
        }
    }

    let models: Vec<Value> = merged.into_values().map(Value::Object).collect();
    json!({ "models": models })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_first_seen_and_backfills_missing_fields() {
        let mut merged: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

        let first = json!({"name": "llama3", "size": 123, "digest": "abc"});
        let second = json!({"name": "llama3", "size": 999, "modified_at": "2026-01-01"});

        for value in [&first, &second] {
            let obj = value.as_object().unwrap();
            let entry = merged.entry("llama3".to_string()).or_insert_with(|| obj.clone());
            for field in ["size", "modified_at", "digest"] {
                let missing = entry.get(field).map(Value::is_null).unwrap_or(true);
                if missing {
                    if let Some(v) = obj.get(field) {
                        entry.insert(field.to_string(), v.clone());
                    }
                }
            }
        }

        let merged_model = &merged["llama3"];
        assert_eq!(merged_model["size"], 123, "first report's size must win");
        assert_eq!(merged_model["digest"], "abc");
        assert_eq!(merged_model["modified_at"], "2026-01-01", "missing field backfilled from later report");
    }
}
