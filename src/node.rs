//! Live per-node state: health, active connections, inventory, WRR bookkeeping.
//!
//! Each node gets its own `Mutex<NodeState>` entry in a [`DashMap`], so a
//! health probe touching node A never contends with a request accounting
//! update against node B. `active_connections` lives in a separate atomic
//! map rather than behind that mutex: `inc_active`/`dec_active` must be
//! callable synchronously from a `Drop` guard on the dispatch path (so a
//! cancelled client still releases its slot), which rules out an
//! `await`-based lock for that one field.

use std::{
    collections::HashSet,
    sync::atomic::{AtomicI64, AtomicUsize, Ordering},
};

use dashmap::DashMap;

use crate::config::NodeConfig;

#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub active_connections: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub is_healthy: bool,
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    pub last_model_sync: Option<chrono::DateTime<chrono::Utc>>,
    /// Smooth-WRR mutable weight; reset to the node's static `weight` every
    /// time the owning [`NodeRegistry`] is reconciled against a reloaded
    /// config.
    pub current_weight: f64,
    pub effective_weight: f64,
    pub models: HashSet<String>,
}

impl NodeState {
    fn fresh(weight: f64) -> Self {
        Self {
            current_weight: weight,
            effective_weight: weight,
            ..Default::default()
        }
    }
}

/// Per-node live state keyed by node name, plus the global round-robin
/// cursor (round-robin is scheduler-wide, not per-node, so it lives here
/// rather than inside any single `NodeState`).
pub struct NodeRegistry {
    states: DashMap<String, tokio::sync::Mutex<NodeState>>,
    active: DashMap<String, AtomicI64>,
    round_robin_cursor: AtomicUsize,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            active: DashMap::new(),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Reconciles live state against a freshly loaded node list: surviving
    /// nodes keep their counters/health but have `current_weight`/
    /// `effective_weight` reset to the newly configured weight; new nodes
    /// get a fresh entry; nodes no longer present are dropped. The
    /// round-robin cursor is left untouched (an intentional Open Question
    /// decision — see DESIGN.md).
    pub async fn reconcile(&self, nodes: &[NodeConfig]) {
        let wanted: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        self.states.retain(|name, _| wanted.contains(name.as_str()));
        self.active.retain(|name, _| wanted.contains(name.as_str()));

        for node in nodes {
            let weight = node.effective_weight();
            let exists = self.states.contains_key(&node.name);
            if exists {
                if let Some(entry) = self.states.get(&node.name) {
                    let mut guard = entry.lock().await;
                    guard.current_weight = weight;
                    guard.effective_weight = weight;
                }
            } else {
                self.states
                    .insert(node.name.clone(), tokio::sync::Mutex::new(NodeState::fresh(weight)));
            }
            self.active.entry(node.name.clone()).or_insert_with(|| AtomicI64::new(0));
        }
    }

    /// Ensures an entry exists for `name`, creating one with the given
    /// static weight if absent. Used by the reconciler and dispatcher paths
    /// that must never observe a missing entry for a node named in the
    /// current snapshot.
    pub fn ensure(&self, name: &str, weight: f64) {
        self.states
            .entry(name.to_string())
            .or_insert_with(|| tokio::sync::Mutex::new(NodeState::fresh(weight)));
        self.active.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0));
    }

    pub async fn read(&self, name: &str) -> Option<NodeState> {
        let entry = self.states.get(name)?;
        let mut state = entry.lock().await.clone();
        state.active_connections = self.active.get(name).map(|a| a.load(Ordering::Relaxed)).unwrap_or(0);
        Some(state)
    }

    /// All known node names, paired with their live state — used to render
    /// `/api/nodes`, `/health`, and the per-node gauges in `/metrics`.
    pub async fn snapshot_all(&self) -> Vec<(String, NodeState)> {
        let names: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(state) = self.read(&name).await {
                out.push((name, state));
            }
        }
        out
    }

    /// Increments `name`'s active-connection count. Synchronous and
    /// lock-free so it can be paired with a `Drop`-based release that runs
    /// even on client cancellation (spec.md invariant: paired exactly once
    /// per accepted request).
    pub fn inc_active(&self, name: &str) {
        self.active
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements `name`'s active-connection count. Never clamps at zero:
    /// an unpaired decrement is a bug in the caller (two releases for one
    /// accept, or a release for a node that never got an increment) and
    /// clamping would hide it. We log loudly instead so it surfaces in
    /// tests and ops dashboards rather than silently self-healing.
    pub fn dec_active(&self, name: &str) {
        if let Some(counter) = self.active.get(name) {
            let previous = counter.fetch_sub(1, Ordering::Relaxed);
            if previous <= 0 {
                tracing::error!(node = name, "active_connections invariant violated: decremented past zero");
            }
        }
    }

    pub async fn set_health(&self, name: &str, healthy: bool) {
        if let Some(entry) = self.states.get(name) {
            let mut guard = entry.lock().await;
            guard.is_healthy = healthy;
            guard.last_health_check = Some(chrono::Utc::now());
        }
    }

    pub async fn set_models(&self, name: &str, models: HashSet<String>) {
        if let Some(entry) = self.states.get(name) {
            let mut guard = entry.lock().await;
            guard.models = models;
            guard.last_model_sync = Some(chrono::Utc::now());
        }
    }

    pub async fn record_request(&self, name: &str) {
        if let Some(entry) = self.states.get(name) {
            entry.lock().await.total_requests += 1;
        }
    }

    pub async fn record_failure(&self, name: &str) {
        if let Some(entry) = self.states.get(name) {
            entry.lock().await.failed_requests += 1;
        }
    }

    /// Advances and returns the next round-robin index, mod `len`. `len`
    /// must be non-zero.
    pub fn next_round_robin(&self, len: usize) -> usize {
        self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Mutates `node_name`'s `current_weight` for one smooth-WRR pick:
    /// adds its static weight, compares against the running max, and if it
    /// wins, subtracts `weight_sum` of all candidates. Returns the current
    /// weight after the add step (the scheduler uses this to find the max
    /// across candidates before calling back in to apply the subtraction).
    pub async fn wrr_step(&self, name: &str, static_weight: f64) -> f64 {
        if let Some(entry) = self.states.get(name) {
            let mut guard = entry.lock().await;
            guard.current_weight += static_weight;
            return guard.current_weight;
        }
        0.0
    }

    pub async fn wrr_settle(&self, name: &str, weight_sum: f64) {
        if let Some(entry) = self.states.get(name) {
            entry.lock().await.current_weight -= weight_sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            kind: crate::config::NodeKind::default(),
            weight: 1.0,
            enabled: true,
            supported_model_ranges: Vec::new(),
        }
    }

    #[tokio::test]
    async fn inc_dec_round_trips_to_zero() {
        let registry = NodeRegistry::new();
        registry.reconcile(&[config("a")]).await;

        registry.inc_active("a");
        registry.inc_active("a");
        assert_eq!(registry.read("a").await.unwrap().active_connections, 2);

        registry.dec_active("a");
        registry.dec_active("a");
        assert_eq!(registry.read("a").await.unwrap().active_connections, 0);
    }

    #[tokio::test]
    async fn reconcile_drops_removed_nodes_and_keeps_survivors() {
        let registry = NodeRegistry::new();
        registry.reconcile(&[config("a"), config("b")]).await;
        registry.set_health("a", true).await;
        registry.inc_active("a");

        registry.reconcile(&[config("a")]).await;

        assert!(registry.read("b").await.is_none());
        let a = registry.read("a").await.unwrap();
        assert!(a.is_healthy, "surviving node must keep its health flag");
        assert_eq!(a.active_connections, 1, "surviving node must keep its active count");
    }

    #[tokio::test]
    async fn reconcile_resets_wrr_weight_to_new_config() {
        let registry = NodeRegistry::new();
        registry.reconcile(&[config("a")]).await;
        registry.wrr_step("a", 5.0).await;

        let mut heavy = config("a");
        heavy.weight = 9.0;
        registry.reconcile(&[heavy]).await;

        let state = registry.read("a").await.unwrap();
        assert_eq!(state.current_weight, 9.0);
    }

    #[tokio::test]
    async fn round_robin_cursor_is_monotonic_and_wraps() {
        let registry = NodeRegistry::new();
        let picks: Vec<usize> = (0..5).map(|_| registry.next_round_robin(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }
}
