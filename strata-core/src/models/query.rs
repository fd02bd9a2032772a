use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
            Direction::Both => "both",
        }
    }

    pub fn includes_outgoing(&self) -> bool {
        matches!(self, Direction::Outgoing | Direction::Both)
    }

    pub fn includes_incoming(&self) -> bool {
        matches!(self, Direction::Incoming | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "outgoing" | "out" => Ok(Direction::Outgoing),
            "incoming" | "in" => Ok(Direction::Incoming),
            "both" | "" => Ok(Direction::Both),
            other => Err(GraphError::Validation(format!(
                "direction must be outgoing, incoming or both (got {})",
                other
            ))),
        }
    }
}

pub const DEFAULT_QUERY_LIMIT: usize = 100;

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeQuery {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for NodeQuery {
    fn default() -> Self {
        Self {
            node_type: None,
            filters: Map::new(),
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl NodeQuery {
    pub fn of_type(node_type: &str) -> Self {
        Self {
            node_type: Some(node_type.to_string()),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.filters.insert(key.to_string(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Bulk node input. Entries with an empty type or id are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NodeSpec {
    pub fn new(node_type: &str, id: &str, data: Map<String, Value>) -> Self {
        Self {
            node_type: node_type.to_string(),
            id: Some(id.to_string()),
            data,
        }
    }
}

/// Bulk edge input. Entries with a missing field or endpoint are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default)]
    pub from_id: String,
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub to_id: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

impl EdgeSpec {
    pub fn new(from_id: &str, relation: &str, to_id: &str) -> Self {
        Self {
            from_id: from_id.to_string(),
            relation: relation.to_string(),
            to_id: to_id.to_string(),
            data: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.from_id.is_empty() && !self.relation.is_empty() && !self.to_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direction_parse() {
        assert_eq!("OUTGOING".parse::<Direction>().unwrap(), Direction::Outgoing);
        assert_eq!("in".parse::<Direction>().unwrap(), Direction::Incoming);
        assert!("sideways".parse::<Direction>().is_err());
        assert!(Direction::Both.includes_incoming() && Direction::Both.includes_outgoing());
    }

    #[test]
    fn test_node_query_body_defaults() {
        let q: NodeQuery = serde_json::from_value(json!({"type": "Task"})).unwrap();
        assert_eq!(q.node_type.as_deref(), Some("Task"));
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 0);
        assert!(q.filters.is_empty());
    }

    #[test]
    fn test_lenient_specs_parse_incomplete_rows() {
        let spec: EdgeSpec = serde_json::from_value(json!({"from_id": "a"})).unwrap();
        assert!(!spec.is_complete());
        let node: NodeSpec = serde_json::from_value(json!({"type": "Task"})).unwrap();
        assert!(node.id.is_none());
    }
}
