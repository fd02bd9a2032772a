use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::node::{short_hex, strip_reserved};

pub const EDGE_TYPE: &str = "Edge";

pub const EDGE_RESERVED_KEYS: [&str; 6] = ["@id", "@type", "from_id", "relation", "to_id", "created_at"];

fn edge_type() -> String {
    EDGE_TYPE.to_string()
}

/// A directed relationship in its JSON-LD wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type", default = "edge_type")]
    pub kind: String,
    pub from_id: String,
    pub relation: String,
    pub to_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Edge {
    pub fn new(
        from_id: &str,
        relation: &str,
        to_id: &str,
        now: &str,
        data: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            id: format!("edge:{}", short_hex()),
            kind: edge_type(),
            from_id: from_id.to_string(),
            relation: relation.to_string(),
            to_id: to_id.to_string(),
            created_at: now.to_string(),
            properties: strip_reserved(data.unwrap_or_default(), &EDGE_RESERVED_KEYS),
        }
    }

    pub fn touches(&self, node_id: &str) -> bool {
        self.from_id == node_id || self.to_id == node_id
    }

    /// The endpoint that is not `node_id`; `to_id` for a self-loop.
    pub fn other_end(&self, node_id: &str) -> &str {
        if self.from_id == node_id {
            &self.to_id
        } else {
            &self.from_id
        }
    }
}
