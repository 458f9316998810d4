//! Routing configuration for model-gateway.
//!
//! The node table is a JSON document on disk (`NODE_CONFIG_FILE`, default
//! `config/node_config.json`). `${VAR}` references anywhere in the document
//! are resolved against the process environment before the document is
//! parsed into typed structs, so secrets never need an indirection field —
//! by the time a [`NodeConfig`] exists, any `api_key` on it already holds the
//! resolved value (or the literal `${VAR}` text, if the variable was unset).
//!
//! Reloads never tear down the whole gateway: a malformed document is
//! rejected and the previous [`RoutingSnapshot`] keeps serving, except at
//! initial startup where a parse failure is fatal.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a node is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// An Ollama instance on the local network. Only `hosts[0]` is ever
    /// dialed — the remaining entries are documented alternates with no
    /// automatic failover between them.
    Local {
        hosts: Vec<String>,
        #[serde(default = "defaults::ollama_port")]
        port: u16,
    },
    /// A cloud provider speaking an Ollama-compatible API.
    External {
        api_url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        timeout_seconds: Option<f64>,
    },
}

impl Default for NodeKind {
    fn default() -> Self {
        NodeKind::Local {
            hosts: Vec::new(),
            port: defaults::ollama_port(),
        }
    }
}

/// Inclusive-minimum, optional-maximum size band a node is willing to serve.
/// An empty `supported_model_ranges` list on a node means "any size" —
/// that's the backward-compatible default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSizeRange {
    #[serde(default)]
    pub min_params_b: u64,
    #[serde(default)]
    pub max_params_b: Option<u64>,
}

impl ModelSizeRange {
    fn contains(&self, size_b: u64) -> bool {
        size_b >= self.min_params_b && self.max_params_b.map_or(true, |max| size_b <= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default = "defaults::weight")]
    pub weight: f64,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub supported_model_ranges: Vec<ModelSizeRange>,
}

impl NodeConfig {
    /// External nodes always carry weight 1.0 regardless of any configured
    /// value — weighting only matters across a pool of interchangeable
    /// local replicas.
    pub fn effective_weight(&self) -> f64 {
        match self.kind {
            NodeKind::External { .. } => 1.0,
            NodeKind::Local { .. } => self.weight,
        }
    }

    pub fn accepts_size(&self, size_b: u64) -> bool {
        self.supported_model_ranges.is_empty()
            || self.supported_model_ranges.iter().any(|r| r.contains(size_b))
    }

    pub fn base_url(&self) -> String {
        match &self.kind {
            NodeKind::External { api_url, .. } => api_url.clone(),
            NodeKind::Local { hosts, port } => {
                let host = hosts.first().map(String::as_str).unwrap_or("localhost");
                format!("http://{host}:{port}")
            }
        }
    }
}

/// Precedence rules for mapping a model identifier to an estimated
/// B-parameter size. See [`crate::model_size::resolve_size`].
#[derive(Debug, Clone, Default)]
pub struct ModelSizeRules {
    /// Substring → size, sorted descending by size so the largest match wins.
    pub patterns: Vec<(String, u64)>,
    pub mapping: HashMap<String, u64>,
    pub default_size_b: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::RoundRobin
    }
}

impl std::str::FromStr for SchedulingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            other => bail!("unknown scheduling strategy {other:?}"),
        }
    }
}

/// An immutable, `Arc`-shareable view of the routing document, published by
/// [`ConfigStore`] and hot-swapped under a `RwLock` by [`crate::router::GatewayState`].
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub nodes: Vec<NodeConfig>,
    pub size_rules: ModelSizeRules,
    pub strategy: SchedulingStrategy,
}

mod defaults {
    pub fn ollama_port() -> u16 {
        11434
    }
    pub fn weight() -> f64 {
        1.0
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn model_size() -> u64 {
        7
    }
}

/// Raw on-disk document shape, deserialized after `${VAR}` interpolation.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawDocument {
    #[serde(default)]
    nodes: Vec<NodeConfig>,
    #[serde(default)]
    model_name_patterns: HashMap<String, u64>,
    #[serde(default)]
    model_name_mapping: HashMap<String, u64>,
    #[serde(default = "defaults::model_size")]
    default_model_size_b: u64,
}

/// Loads, validates, saves and hot-reloads the routing document.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Resolves `NODE_CONFIG_FILE` against `project_root`, honoring the
    /// legacy `node_config.json` → `config/node_config.json` redirect and
    /// falling back to the old flat location if the resolved path is
    /// missing.
    pub fn resolve_path(project_root: &Path) -> PathBuf {
        let configured = env::var("NODE_CONFIG_FILE").unwrap_or_else(|_| "config/node_config.json".into());

        let candidate = if configured == "node_config.json" {
            project_root.join("config").join("node_config.json")
        } else {
            let p = Path::new(&configured);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                project_root.join(p)
            }
        };

        if candidate.exists() {
            return candidate;
        }
        let legacy = project_root.join("node_config.json");
        if legacy.exists() {
            return legacy;
        }
        candidate
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document from disk, interpolates `${VAR}` references,
    /// validates it, and returns a fresh [`RoutingSnapshot`] plus the raw
    /// (uninterpolated) JSON value for `/api/config` GET and `/debug/config`.
    pub fn load(&self) -> anyhow::Result<(RoutingSnapshot, Value)> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("config file not found at {}", self.path.display()))?;
        let raw_value: Value = serde_json::from_str(&text).context("config file is not valid JSON")?;
        let interpolated = interpolate(raw_value.clone());
        let doc: RawDocument =
            serde_json::from_value(interpolated).context("config document does not match the expected shape")?;

        let strategy = env::var("SCHEDULING_STRATEGY")
            .ok()
            .map(|s| s.parse::<SchedulingStrategy>())
            .transpose()?
            .unwrap_or_default();

        let mut patterns: Vec<(String, u64)> = doc.model_name_patterns.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1));

        let snapshot = RoutingSnapshot {
            nodes: doc.nodes,
            size_rules: ModelSizeRules {
                patterns,
                mapping: doc.model_name_mapping,
                default_size_b: doc.default_model_size_b,
            },
            strategy,
        };

        validate(&snapshot)?;
        Ok((snapshot, raw_value))
    }

    /// Validates and writes `doc` to disk, backing up the previous file
    /// first, then reloads. Returns the reloaded snapshot.
    pub fn save(&self, doc: &Value) -> anyhow::Result<(RoutingSnapshot, Value)> {
        if !doc.is_object() {
            bail!("config document must be a JSON object");
        }

        // Validate by attempting a full load-from-value before touching disk.
        let interpolated = interpolate(doc.clone());
        let parsed: RawDocument =
            serde_json::from_value(interpolated).context("config document does not match the expected shape")?;
        let mut patterns: Vec<(String, u64)> = parsed.model_name_patterns.iter().map(|(k, v)| (k.clone(), *v)).collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1));
        validate(&RoutingSnapshot {
            nodes: parsed.nodes,
            size_rules: ModelSizeRules {
                patterns,
                mapping: parsed.model_name_mapping,
                default_size_b: parsed.default_model_size_b,
            },
            strategy: SchedulingStrategy::default(),
        })?;

        if self.path.exists() {
            self.backup()?;
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating config directory")?;
        }
        let pretty = serde_json::to_string_pretty(doc).context("serializing config document")?;
        std::fs::write(&self.path, pretty).context("writing config document")?;

        self.load()
    }

    fn backup(&self) -> anyhow::Result<()> {
        let backups_dir = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backups");
        std::fs::create_dir_all(&backups_dir).context("creating backups directory")?;

        let file_name = self
            .path
            .file_name()
            .context("config path has no file name")?
            .to_string_lossy();
        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup_path = backups_dir.join(format!("{file_name}.backup.{unix_seconds}"));
        std::fs::copy(&self.path, &backup_path).context("copying config backup")?;
        Ok(())
    }
}

fn validate(snapshot: &RoutingSnapshot) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    for node in &snapshot.nodes {
        if !seen.insert(node.name.as_str()) {
            bail!("duplicate node name {:?}", node.name);
        }
        for range in &node.supported_model_ranges {
            if let Some(max) = range.max_params_b {
                if range.min_params_b > max {
                    bail!(
                        "node {:?} has a supported_model_ranges entry with min_params_b {} > max_params_b {}",
                        node.name,
                        range.min_params_b,
                        max
                    );
                }
            }
        }
    }
    Ok(())
}

/// Recursively substitutes `${VAR}` references with the matching
/// environment variable's value. A reference to an unset variable is left
/// in place verbatim, matching the original's `resolve_env_var`.
fn interpolate(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(interpolate).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, interpolate(v))).collect())
        }
        other => other,
    }
}

fn interpolate_str(s: &str) -> String {
    let re = var_pattern();
    re.replace_all(s, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

fn var_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_resolves_known_var() {
        std::env::set_var("GATEWAY_TEST_VAR_A", "secret-value");
        let resolved = interpolate_str("Bearer ${GATEWAY_TEST_VAR_A}");
        assert_eq!(resolved, "Bearer secret-value");
        std::env::remove_var("GATEWAY_TEST_VAR_A");
    }

    #[test]
    fn interpolate_leaves_unknown_var_literal() {
        let resolved = interpolate_str("Bearer ${GATEWAY_TEST_VAR_DOES_NOT_EXIST}");
        assert_eq!(resolved, "Bearer ${GATEWAY_TEST_VAR_DOES_NOT_EXIST}");
    }

    #[test]
    fn interpolate_recurses_into_nested_structures() {
        std::env::set_var("GATEWAY_TEST_VAR_B", "resolved");
        let value = serde_json::json!({
            "nodes": [{"headers": {"Authorization": "${GATEWAY_TEST_VAR_B}"}}]
        });
        let out = interpolate(value);
        assert_eq!(out["nodes"][0]["headers"]["Authorization"], "resolved");
        std::env::remove_var("GATEWAY_TEST_VAR_B");
    }

    #[test]
    fn external_node_weight_is_always_one() {
        let node = NodeConfig {
            name: "cloud".into(),
            kind: NodeKind::External {
                api_url: "https://example.com".into(),
                api_key: None,
                headers: HashMap::new(),
                timeout_seconds: None,
            },
            weight: 5.0,
            enabled: true,
            supported_model_ranges: Vec::new(),
        };
        assert_eq!(node.effective_weight(), 1.0);
    }

    #[test]
    fn empty_ranges_accept_any_size() {
        let node = NodeConfig {
            name: "n".into(),
            kind: NodeKind::default(),
            weight: 1.0,
            enabled: true,
            supported_model_ranges: Vec::new(),
        };
        assert!(node.accepts_size(70));
    }

    #[test]
    fn range_respects_min_and_optional_max() {
        let node = NodeConfig {
            name: "n".into(),
            kind: NodeKind::default(),
            weight: 1.0,
            enabled: true,
            supported_model_ranges: vec![ModelSizeRange {
                min_params_b: 7,
                max_params_b: Some(13),
            }],
        };
        assert!(!node.accepts_size(3));
        assert!(node.accepts_size(7));
        assert!(node.accepts_size(13));
        assert!(!node.accepts_size(70));
    }

    #[test]
    fn duplicate_node_names_rejected() {
        let snapshot = RoutingSnapshot {
            nodes: vec![
                NodeConfig {
                    name: "a".into(),
                    kind: NodeKind::default(),
                    weight: 1.0,
                    enabled: true,
                    supported_model_ranges: Vec::new(),
                },
                NodeConfig {
                    name: "a".into(),
                    kind: NodeKind::default(),
                    weight: 1.0,
                    enabled: true,
                    supported_model_ranges: Vec::new(),
                },
            ],
            size_rules: ModelSizeRules::default(),
            strategy: SchedulingStrategy::default(),
        };
        assert!(validate(&snapshot).is_err());
    }

    #[test]
    fn inverted_range_rejected() {
        let snapshot = RoutingSnapshot {
            nodes: vec![NodeConfig {
                name: "a".into(),
                kind: NodeKind::default(),
                weight: 1.0,
                enabled: true,
                supported_model_ranges: vec![ModelSizeRange {
                    min_params_b: 70,
                    max_params_b: Some(7),
                }],
            }],
            size_rules: ModelSizeRules::default(),
            strategy: SchedulingStrategy::default(),
        };
        assert!(validate(&snapshot).is_err());
    }

    #[test]
    fn unknown_strategy_string_rejected() {
        assert!("made_up_strategy".parse::<SchedulingStrategy>().is_err());
    }
}
