//! Candidate selection across the node pool.
//!
//! Candidate-set construction is uniform for both the model-constrained and
//! no-model-name paths: always `enabled ∧ is_healthy`, then (if a model was
//! named) further narrowed by model-set membership and size suitability,
//! falling back to the permissive (health-only) set if the constrained set
//! is empty. Ported from `select_node`/`filter_nodes_by_model`/`NodeSelector`
//! in the original gateway.

use crate::{
    config::{NodeConfig, SchedulingStrategy},
    node::{NodeRegistry, NodeState},
};

pub struct Candidate<'a> {
    pub config: &'a NodeConfig,
    pub state: NodeState,
}

/// Builds the constrained candidate set (has the model, healthy, enabled,
/// and sized appropriately) and, if empty, falls back to the permissive set
/// (healthy + enabled only, regardless of model/size) so unseen models can
/// still be routed somewhere to trigger a pull.
pub async fn candidates<'a>(
    nodes: &'a [NodeConfig],
    registry: &NodeRegistry,
    model_base_name: Option<&str>,
    model_size_b: Option<u64>,
) -> Vec<Candidate<'a>> {
    let mut healthy_enabled = Vec::new();
    for node in nodes {
        if !node.enabled {
            continue;
        }
        let Some(state) = registry.read(&node.name).await else {
            continue;
        };
        if !state.is_healthy {
            continue;
        }
        healthy_enabled.push((node, state));
    }

    if let (Some(model), Some(size)) = (model_base_name, model_size_b) {
        let constrained: Vec<Candidate> = healthy_enabled
            .iter()
            .filter(|(node, state)| state.models.contains(model) && node.accepts_size(size))
            .map(|(node, state)| Candidate {
                config: node,
                state: state.clone(),
            })
            .collect();
        if !constrained.is_empty() {
            return constrained;
        }
    }

    healthy_enabled
        .into_iter()
        .map(|(node, state)| Candidate { config: node, state })
        .collect()
}

/// Stateless per-call scheduling logic; the mutable state it reads/writes
/// (round-robin cursor, per-node `current_weight`) lives in [`NodeRegistry`]
/// so it survives across calls and is correctly shared under concurrent
/// dispatch.
pub struct Scheduler {
    pub strategy: SchedulingStrategy,
}

impl Scheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub async fn select<'a>(&self, candidates: &[Candidate<'a>], registry: &NodeRegistry) -> Option<&'a NodeConfig> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            SchedulingStrategy::RoundRobin => {
                let idx = registry.next_round_robin(candidates.len());
                Some(candidates[idx].config)
            }
            SchedulingStrategy::LeastConnections => candidates
                .iter()
                .min_by_key(|c| c.state.active_connections)
                .map(|c| c.config),
            SchedulingStrategy::WeightedRoundRobin => self.weighted_round_robin(candidates, registry).await,
        }
    }

    /// Smooth weighted round-robin, nginx-style: every candidate's
    /// `current_weight` is bumped by its static weight; the highest
    /// resulting value wins and has the sum of all candidate weights
    /// subtracted back off, spreading picks proportionally to weight over
    /// time rather than in bursts.
    async fn weighted_round_robin<'a>(
        &self,
        candidates: &[Candidate<'a>],
        registry: &NodeRegistry,
    ) -> Option<&'a NodeConfig> {
        let weight_sum: f64 = candidates.iter().map(|c| c.config.effective_weight()).sum();

        let mut winner: Option<(&'a NodeConfig, f64)> = None;
        for c in candidates {
            let updated = registry.wrr_step(&c.config.name, c.config.effective_weight()).await;
            if winner.map_or(true, |(_, best)| updated > best) {
                winner = Some((c.config, updated));
            }
        }

        if let Some((node, _)) = winner {
            registry.wrr_settle(&node.name, weight_sum).await;
        }
        winner.map(|(node, _)| node)
    }
}
