use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const SCHEMA_VERSION: &str = "1.0";

pub const DEFAULT_NODE_TYPES: [&str; 6] = ["Task", "Topic", "Goal", "Project", "Person", "Transcript"];

pub const DEFAULT_RELATION_TYPES: [&str; 8] = [
    "hasTopic",
    "parent",
    "derivedFrom",
    "supportsGoal",
    "hasTask",
    "dependsOn",
    "assignedTo",
    "relatedTo",
];

/// Vocabulary document: namespace context plus known node and relation types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "@context", default)]
    pub context: Map<String, Value>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub node_types: Vec<String>,
    #[serde(default)]
    pub relation_types: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            context: default_context(),
            version: default_version(),
            node_types: DEFAULT_NODE_TYPES.iter().map(|s| s.to_string()).collect(),
            relation_types: DEFAULT_RELATION_TYPES.iter().map(|s| s.to_string()).collect(),
            extra: Map::new(),
        }
    }
}

pub fn default_context() -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("@vocab".into(), json!("https://schema.org/"));
    ctx.insert("Task".into(), json!("https://schema.org/Action"));
    ctx.insert("Topic".into(), json!("https://schema.org/Thing"));
    ctx.insert("Goal".into(), json!("https://schema.org/Thing"));
    ctx.insert("Project".into(), json!("https://schema.org/Project"));
    ctx.insert("Person".into(), json!("https://schema.org/Person"));
    for relation in DEFAULT_RELATION_TYPES {
        ctx.insert(relation.into(), json!({"@type": "@id"}));
    }
    ctx
}

/// Counts reported by `get_stats`; backend-specific details are flattened in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub storage_backend: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Outcome of a consistency pass over persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub indexed_nodes: usize,
    pub stale_index_entries: usize,
    pub unindexed_nodes: usize,
    pub dangling_edges_removed: usize,
}
