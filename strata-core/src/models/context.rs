use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::edge::Edge;
use super::node::Node;

/// JSON-LD document returned by every retrieval operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphContext {
    #[serde(rename = "@context", default)]
    pub context: Map<String, Value>,
    #[serde(rename = "@graph", default)]
    pub graph: Vec<Node>,
    #[serde(rename = "_edges", default)]
    pub edges: Vec<Edge>,
    #[serde(rename = "_paths", default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathSummary>>,
    #[serde(rename = "_meta", default)]
    pub meta: Map<String, Value>,
}

impl GraphContext {
    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn node_ids(&self) -> HashSet<&str> {
        self.graph.iter().map(|n| n.id.as_str()).collect()
    }

    /// Drop edges with an endpoint outside the node set.
    pub fn prune_edges(&mut self) {
        let ids: HashSet<String> = self.graph.iter().map(|n| n.id.clone()).collect();
        self.edges
            .retain(|e| ids.contains(&e.from_id) && ids.contains(&e.to_id));
    }
}

/// One hop of a path as reported in `_paths`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathStep {
    Edge { edge: String, relation: String },
    Node { node: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSummary {
    pub from: String,
    pub to: String,
    pub steps: Vec<PathStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathItem {
    Edge(Edge),
    Node(Node),
}

/// Alternating node, edge, node, ..., node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphPath {
    pub items: Vec<PathItem>,
}

impl GraphPath {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.items.iter().filter_map(|item| match item {
            PathItem::Node(n) => Some(n),
            PathItem::Edge(_) => None,
        })
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.items.iter().filter_map(|item| match item {
            PathItem::Edge(e) => Some(e),
            PathItem::Node(_) => None,
        })
    }

    pub fn hop_count(&self) -> usize {
        self.edges().count()
    }

    pub fn summary(&self, from: &str, to: &str) -> PathSummary {
        let steps = self
            .items
            .iter()
            .map(|item| match item {
                PathItem::Node(n) => PathStep::Node { node: n.id.clone() },
                PathItem::Edge(e) => PathStep::Edge {
                    edge: e.id.clone(),
                    relation: e.relation.clone(),
                },
            })
            .collect();
        PathSummary {
            from: from.to_string(),
            to: to.to_string(),
            steps,
        }
    }
}

/// Result of a breadth-first traversal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Traversal {
    pub start_node: String,
    pub depth: usize,
    pub node_count: usize,
    pub edge_count: usize,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Insertion-ordered, id-keyed node and edge sets. A later insert of the
/// same id replaces the value in place.
#[derive(Debug, Default)]
pub struct GraphAccumulator {
    nodes: Vec<Node>,
    node_pos: HashMap<String, usize>,
    edges: Vec<Edge>,
    edge_pos: HashMap<String, usize>,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) {
        match self.node_pos.get(&node.id) {
            Some(&i) => self.nodes[i] = node,
            None => {
                self.node_pos.insert(node.id.clone(), self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    pub fn add_edge(&mut self, edge: Edge) {
        match self.edge_pos.get(&edge.id) {
            Some(&i) => self.edges[i] = edge,
            None => {
                self.edge_pos.insert(edge.id.clone(), self.edges.len());
                self.edges.push(edge);
            }
        }
    }

    pub fn extend(&mut self, nodes: impl IntoIterator<Item = Node>, edges: impl IntoIterator<Item = Edge>) {
        nodes.into_iter().for_each(|n| self.add_node(n));
        edges.into_iter().for_each(|e| self.add_edge(e));
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn into_parts(self) -> (Vec<Node>, Vec<Edge>) {
        (self.nodes, self.edges)
    }
}
