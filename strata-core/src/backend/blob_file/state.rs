use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::models::{Edge, Node};

/// Object keys under a graph prefix.
#[derive(Debug, Clone)]
pub struct Layout {
    prefix: String,
}

impl Layout {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn nodes_dir(&self) -> String {
        format!("{}nodes/", self.prefix)
    }

    /// Case-variant types share a file.
    pub fn node_file(&self, node_type: &str) -> String {
        format!("{}nodes/{}.jsonl", self.prefix, node_type.to_lowercase())
    }

    pub fn edges(&self) -> String {
        format!("{}edges/relationships.jsonl", self.prefix)
    }

    pub fn node_index(&self) -> String {
        format!("{}indexes/node_index.json", self.prefix)
    }

    pub fn type_index(&self) -> String {
        format!("{}indexes/by_type.json", self.prefix)
    }

    pub fn schema(&self) -> String {
        format!("{}schema.json", self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLocation {
    #[serde(rename = "type")]
    pub node_type: String,
    pub file: String,
}

/// `indexes/node_index.json`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodeIndexDoc {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeLocation>,
}

/// `indexes/by_type.json`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TypeIndexDoc {
    #[serde(default)]
    pub types: BTreeMap<String, BTreeSet<String>>,
}

/// The edge file held in memory with an incidence map.
///
/// File order is preserved. A repeated edge id keeps its first position and
/// takes the last value.
#[derive(Debug, Default)]
pub struct EdgeIndex {
    edges: HashMap<String, Edge>,
    order: Vec<String>,
    incident: HashMap<String, Vec<String>>,
}

impl EdgeIndex {
    pub fn from_edges(edges: Vec<Edge>) -> Self {
        let mut index = Self::default();
        for edge in edges {
            index.insert(edge);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn insert(&mut self, edge: Edge) {
        if let Some(existing) = self.edges.get_mut(&edge.id) {
            *existing = edge;
            return;
        }
        self.link(&edge.from_id, &edge.id);
        if edge.to_id != edge.from_id {
            self.link(&edge.to_id, &edge.id);
        }
        self.order.push(edge.id.clone());
        self.edges.insert(edge.id.clone(), edge);
    }

    fn link(&mut self, node_id: &str, edge_id: &str) {
        self.incident
            .entry(node_id.to_string())
            .or_default()
            .push(edge_id.to_string());
    }

    fn unlink(&mut self, node_id: &str, edge_id: &str) {
        if let Some(ids) = self.incident.get_mut(node_id) {
            ids.retain(|id| id != edge_id);
            if ids.is_empty() {
                self.incident.remove(node_id);
            }
        }
    }

    pub fn remove(&mut self, edge_id: &str) -> Option<Edge> {
        let edge = self.edges.remove(edge_id)?;
        self.order.retain(|id| id != edge_id);
        self.unlink(&edge.from_id, edge_id);
        self.unlink(&edge.to_id, edge_id);
        Some(edge)
    }

    /// Remove every edge touching `node_id`.
    pub fn remove_incident(&mut self, node_id: &str) -> Vec<Edge> {
        let ids = self.incident.get(node_id).cloned().unwrap_or_default();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove every edge matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&Edge) -> bool) -> Vec<Edge> {
        let ids: Vec<String> = self
            .iter()
            .filter(|e| predicate(*e))
            .map(|e| e.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Edges touching `node_id`, in file order.
    pub fn incident(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.incident
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.edges.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.order.iter().filter_map(|id| self.edges.get(id))
    }
}

/// Everything one backend instance has read from storage.
#[derive(Debug, Default)]
pub struct GraphState {
    pub node_index: HashMap<String, NodeLocation>,
    pub type_index: BTreeMap<String, BTreeSet<String>>,
    pub edges: EdgeIndex,
    /// Parsed node files by key.
    pub files: HashMap<String, Vec<Node>>,
    /// Generation last observed per key; `None` means observed absent.
    pub generations: HashMap<String, Option<i64>>,
    /// Set after a failed write; the next access reloads from storage.
    pub stale: bool,
}

impl GraphState {
    pub fn index_node(&mut self, node: &Node, file: &str) {
        self.node_index.insert(
            node.id.clone(),
            NodeLocation {
                node_type: node.node_type.clone(),
                file: file.to_string(),
            },
        );
        self.type_index
            .entry(node.node_type.clone())
            .or_default()
            .insert(node.id.clone());
    }

    pub fn unindex_node(&mut self, node_id: &str) -> Option<NodeLocation> {
        let location = self.node_index.remove(node_id)?;
        if let Some(ids) = self.type_index.get_mut(&location.node_type) {
            ids.remove(node_id);
            if ids.is_empty() {
                self.type_index.remove(&location.node_type);
            }
        }
        Some(location)
    }

    /// Recompute the type index from the node index.
    pub fn rebuild_type_index(&mut self) {
        let mut types: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, loc) in &self.node_index {
            types.entry(loc.node_type.clone()).or_default().insert(id.clone());
        }
        self.type_index = types;
    }

    /// Put `node` into its file, replacing a line with the same id left
    /// behind by an earlier write that never reached the index.
    pub fn place_node(&mut self, file: &str, node: Node) {
        let nodes = self.files.entry(file.to_string()).or_default();
        nodes.retain(|n| n.id != node.id);
        nodes.push(node);
    }

    pub fn node_index_doc(&self) -> NodeIndexDoc {
        NodeIndexDoc {
            nodes: self
                .node_index
                .iter()
                .map(|(id, loc)| (id.clone(), loc.clone()))
                .collect(),
        }
    }

    pub fn type_index_doc(&self) -> TypeIndexDoc {
        TypeIndexDoc {
            types: self.type_index.clone(),
        }
    }
}
