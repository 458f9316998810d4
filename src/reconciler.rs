//! Health & Inventory Reconciler.
//!
//! Every 30 seconds, probes each enabled node's `/api/tags` with a 5s
//! timeout and updates its health flag and model set. Ported from
//! `health_check_node`/`get_node_models`/`periodic_health_check` in the
//! original gateway. Runs one synchronous pass at startup before the HTTP
//! listener binds (`startup_event` in the original blocks server readiness
//! on this), then keeps running in the background for the process lifetime.

use std::time::Duration;

use reqwest::Client;

use crate::{config::NodeConfig, node::NodeRegistry};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(serde::Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(serde::Deserialize)]
struct TagsModel {
    name: String,
}

/// Probes one node and updates its registry entry. Never returns an error —
/// a failed probe marks the node unhealthy and logs at `warn`, it does not
/// abort the caller's loop over the rest of the fleet.
async fn probe_one(client: &Client, registry: &NodeRegistry, node: &NodeConfig) {
    if !node.enabled {
        return;
    }
    registry.ensure(&node.name, node.effective_weight());

    let url = format!("{}/api/tags", node.base_url());
    let result = client.get(&url).timeout(PROBE_TIMEOUT).send().await;

    match result {
        Ok(resp) if resp.status().is_success() => match resp.json::<TagsResponse>().await {
            Ok(tags) => {
                let models = tags
                    .models
                    .into_iter()
                    .map(|m| match m.name.split_once(':') {
                        Some((base, _tag)) => base.to_string(),
                        None => m.name,
                    })
                    .collect();
                registry.set_models(&node.name, models).await;
                registry.set_health(&node.name, true).await;
            }
            Err(err) => {
                tracing::warn!(node = %node.name, error = %err, "node returned unparseable /api/tags body");
                registry.set_health(&node.name, false).await;
            }
        },
        Ok(resp) => {
            tracing::warn!(node = %node.name, status = %resp.status(), "node /api/tags probe failed");
            registry.set_health(&node.name, false).await;
        }
        Err(err) => {
            tracing::warn!(node = %node.name, error = %err, "node /api/tags probe errored");
            registry.set_health(&node.name, false).await;
        }
    }
}

/// Runs one probe pass across every node in `nodes`, concurrently.
pub async fn probe_all(client: &Client, registry: &NodeRegistry, nodes: &[NodeConfig]) {
    let probes = nodes.iter().map(|node| probe_one(client, registry, node));
    futures_util::future::join_all(probes).await;
}
