//! Context extraction for prompts.
//!
//! Four retrieval styles sit on top of the backend's shared algorithms:
//! neighbourhood subgraphs around focal nodes, relational paths between
//! nodes, entity-level neighbourhoods and relation-level scans. Hybrid and
//! query-driven retrieval combine them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::GraphBackend;
use crate::config::RetrievalConfig;
use crate::error::{GraphError, Result};
use crate::models::{Edge, GraphAccumulator, GraphContext, GraphPath, Node, NodeQuery, PathItem};

/// Nodes scanned when matching a free-text query.
pub const QUERY_SCAN_LIMIT: usize = 500;

/// Relations used when a query asks about categories rather than things.
pub const QUERY_RELATION_TYPES: [&str; 3] = ["hasTopic", "supportsGoal", "dependsOn"];

const PATH_WORDS: [&str; 4] = ["path", "connect", "between", "relationship"];
const RELATION_WORDS: [&str; 4] = ["all", "every", "type of", "category"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Auto,
    Subgraph,
    Path,
    Entity,
    Relation,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Auto => "auto",
            RetrievalMode::Subgraph => "subgraph",
            RetrievalMode::Path => "path",
            RetrievalMode::Entity => "entity",
            RetrievalMode::Relation => "relation",
        }
    }

    /// Keyword router for `Auto`: path words win over relation words.
    pub fn route(query: &str) -> Self {
        let q = query.to_lowercase();
        if PATH_WORDS.iter().any(|w| q.contains(w)) {
            RetrievalMode::Path
        } else if RELATION_WORDS.iter().any(|w| q.contains(w)) {
            RetrievalMode::Relation
        } else {
            RetrievalMode::Entity
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(RetrievalMode::Auto),
            "subgraph" => Ok(RetrievalMode::Subgraph),
            "path" => Ok(RetrievalMode::Path),
            "entity" => Ok(RetrievalMode::Entity),
            "relation" => Ok(RetrievalMode::Relation),
            other => Err(GraphError::Validation(format!(
                "mode must be auto, subgraph, path, entity or relation (got {})",
                other
            ))),
        }
    }
}

/// One path between two nodes, split into parts and told as a sentence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectingPath {
    pub from: String,
    pub to: String,
    /// Number of nodes on the path.
    pub length: usize,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub narrative: String,
}

/// `(Task: Ship beta) --[hasTopic]--> (Topic: Work)`
pub fn path_narrative(path: &GraphPath) -> String {
    path.items
        .iter()
        .map(|item| match item {
            PathItem::Edge(e) => format!(" --[{}]--> ", e.relation),
            PathItem::Node(n) => {
                let name = n
                    .str_prop("name")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .or_else(|| {
                        n.str_prop("description")
                            .filter(|s| !s.is_empty())
                            .map(|d| d.chars().take(30).collect())
                    })
                    .unwrap_or_else(|| n.id.clone());
                format!("({}: {})", n.node_type, name)
            }
        })
        .collect()
}

/// Inputs for [`SubgraphService::extract_hybrid_context`]. Each present
/// field turns on one strategy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HybridRequest {
    #[serde(default)]
    pub focal_node_id: Option<String>,
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub relation_types: Option<Vec<String>>,
    #[serde(default)]
    pub depth: Option<usize>,
}

#[derive(Clone)]
pub struct SubgraphService {
    backend: Arc<dyn GraphBackend>,
    limits: RetrievalConfig,
}

impl SubgraphService {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            backend,
            limits: RetrievalConfig::default(),
        }
    }

    pub fn with_limits(mut self, limits: RetrievalConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &RetrievalConfig {
        &self.limits
    }

    // ========================================================================
    // Subgraphs
    // ========================================================================

    /// Neighbourhood of one node, cut to the first `max_nodes` nodes with
    /// edges pruned to the survivors.
    pub async fn extract_subgraph(
        &self,
        node_id: &str,
        depth: usize,
        include_types: Option<&[String]>,
        max_nodes: usize,
    ) -> Result<GraphContext> {
        let mut ctx = self.backend.get_subgraph(node_id, depth, include_types).await?;
        if ctx.graph.len() > max_nodes {
            ctx.graph.truncate(max_nodes);
            ctx.prune_edges();
            ctx.set_meta("node_count", ctx.graph.len());
            ctx.set_meta("edge_count", ctx.edges.len());
            ctx.set_meta("truncated", true);
        }
        Ok(ctx)
    }

    /// Union of the subgraphs around each focal node.
    pub async fn extract_multi_focal(
        &self,
        node_ids: &[String],
        depth: usize,
        include_types: Option<&[String]>,
    ) -> Result<GraphContext> {
        let mut acc = GraphAccumulator::new();
        for id in node_ids {
            let sub = self.backend.get_subgraph(id, depth, include_types).await?;
            acc.extend(sub.graph, sub.edges);
        }

        let mut ctx = self.merged(acc).await?;
        ctx.set_meta("focal_nodes", json!(node_ids));
        ctx.set_meta("depth", depth);
        ctx.set_meta("retrieval_mode", "multi_focal");
        Ok(ctx)
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Paths between every pair of `node_ids`, shortest first, at most
    /// `max_paths` of them.
    pub async fn extract_paths(
        &self,
        node_ids: &[String],
        max_depth: usize,
        relations: Option<&[String]>,
        max_paths: usize,
    ) -> Result<GraphContext> {
        let mut ctx = self
            .backend
            .get_path_context(node_ids, max_depth, relations)
            .await?;
        if let Some(paths) = ctx.paths.as_mut() {
            paths.sort_by_key(|p| p.steps.len());
            paths.truncate(max_paths);
        }
        ctx.set_meta("retrieval_mode", "path");
        Ok(ctx)
    }

    pub async fn find_connecting_paths(
        &self,
        from_id: &str,
        to_id: &str,
        max_depth: usize,
    ) -> Result<Vec<ConnectingPath>> {
        let paths = self.backend.find_paths(from_id, to_id, max_depth, None).await?;
        Ok(paths
            .into_iter()
            .map(|path| ConnectingPath {
                from: from_id.to_string(),
                to: to_id.to_string(),
                length: path.nodes().count(),
                nodes: path.nodes().cloned().collect(),
                edges: path.edges().cloned().collect(),
                narrative: path_narrative(&path),
            })
            .collect())
    }

    // ========================================================================
    // Entity and relation level
    // ========================================================================

    pub async fn extract_entity_context(
        &self,
        entity_ids: &[String],
        include_relations: bool,
        depth: usize,
    ) -> Result<GraphContext> {
        let mut ctx = self
            .backend
            .get_entity_context(entity_ids, include_relations, depth)
            .await?;
        ctx.set_meta("retrieval_mode", "entity");
        Ok(ctx)
    }

    pub async fn extract_relation_context(&self, relation_types: &[String], limit: usize) -> Result<GraphContext> {
        let mut ctx = self.backend.get_relation_context(relation_types, limit).await?;
        ctx.set_meta("retrieval_mode", "relation");
        Ok(ctx)
    }

    // ========================================================================
    // Hybrid
    // ========================================================================

    /// Run every requested strategy and merge the results. Strategies that
    /// ran are listed in `_meta.strategies_used`.
    pub async fn extract_hybrid_context(&self, request: &HybridRequest) -> Result<GraphContext> {
        let depth = request.depth.unwrap_or(self.limits.default_depth);
        let mut acc = GraphAccumulator::new();
        let mut strategies: Vec<&str> = Vec::new();

        if let Some(focal) = request.focal_node_id.as_deref().filter(|f| !f.is_empty()) {
            let sub = self
                .extract_subgraph(focal, depth, None, self.limits.max_nodes)
                .await?;
            acc.extend(sub.graph, sub.edges);
            strategies.push("subgraph");
        }

        if let Some(ids) = request.entity_ids.as_deref().filter(|ids| !ids.is_empty()) {
            let entity = self.extract_entity_context(ids, true, 1).await?;
            acc.extend(entity.graph, entity.edges);
            strategies.push("entity");
        }

        if let Some(types) = request.relation_types.as_deref().filter(|t| !t.is_empty()) {
            let relation = self
                .extract_relation_context(types, self.limits.relation_limit)
                .await?;
            acc.extend(relation.graph, relation.edges);
            strategies.push("relation");
        }

        let mut ctx = self.merged(acc).await?;
        ctx.set_meta("retrieval_mode", "hybrid");
        ctx.set_meta("strategies_used", json!(strategies));
        if strategies.contains(&"subgraph") {
            ctx.set_meta("focal_node", json!(request.focal_node_id));
        }
        if strategies.contains(&"entity") {
            ctx.set_meta("entity_ids", json!(request.entity_ids));
        }
        if strategies.contains(&"relation") {
            ctx.set_meta("relation_types", json!(request.relation_types));
        }
        Ok(ctx)
    }

    // ========================================================================
    // Query-driven
    // ========================================================================

    /// Pick nodes whose name or description mention the query's words and
    /// retrieve around them.
    ///
    /// This is keyword matching, not semantic search: each distinct query
    /// word longer than two characters scores one point per node whose
    /// `name + " " + description` contains it.
    pub async fn retrieve_for_query(
        &self,
        query: &str,
        mode: RetrievalMode,
        max_nodes: usize,
    ) -> Result<GraphContext> {
        let mode = match mode {
            RetrievalMode::Auto => RetrievalMode::route(query),
            explicit => explicit,
        };

        let nodes = self
            .backend
            .query_nodes(&NodeQuery::default().limit(QUERY_SCAN_LIMIT))
            .await?;
        let mut candidates = rank_candidates(query, &nodes);
        if candidates.is_empty() {
            candidates = nodes.iter().take(5).map(|n| n.id.clone()).collect();
        }
        tracing::debug!(query = %query, mode = %mode, candidates = candidates.len(), "Query retrieval");

        if candidates.is_empty() && mode != RetrievalMode::Relation {
            let mut ctx = GraphContext::default();
            ctx.set_meta("error", "No relevant nodes found");
            ctx.set_meta("query", query);
            return Ok(ctx);
        }

        let mut ctx = match mode {
            RetrievalMode::Path if candidates.len() >= 2 => {
                let ids = &candidates[..candidates.len().min(5)];
                self.extract_paths(ids, 3, None, self.limits.max_paths).await?
            }
            RetrievalMode::Relation => {
                let types: Vec<String> = QUERY_RELATION_TYPES.iter().map(|t| t.to_string()).collect();
                self.extract_relation_context(&types, max_nodes).await?
            }
            RetrievalMode::Subgraph => {
                let ids = &candidates[..candidates.len().min(3)];
                self.extract_multi_focal(ids, 2, None).await?
            }
            _ => {
                let ids = &candidates[..candidates.len().min(3)];
                self.extract_entity_context(ids, true, 2).await?
            }
        };
        ctx.set_meta("query", query);
        Ok(ctx)
    }

    async fn merged(&self, acc: GraphAccumulator) -> Result<GraphContext> {
        let schema = self.backend.get_schema().await?;
        let (graph, edges) = acc.into_parts();
        let mut ctx = GraphContext {
            context: schema.context,
            graph,
            edges,
            ..GraphContext::default()
        };
        ctx.set_meta("node_count", ctx.graph.len());
        ctx.set_meta("edge_count", ctx.edges.len());
        ctx.set_meta("extracted_at", self.backend.clock().now());
        Ok(ctx)
    }
}

/// Top ten node ids by keyword hits, ties broken by id descending.
fn rank_candidates(query: &str, nodes: &[Node]) -> Vec<String> {
    let lowered = query.to_lowercase();
    let words: HashSet<&str> = lowered
        .split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .collect();

    let mut scored: Vec<(usize, &str)> = nodes
        .iter()
        .filter_map(|node| {
            let text = format!(
                "{} {}",
                node.str_prop("name").unwrap_or_default(),
                node.str_prop("description").unwrap_or_default()
            )
            .to_lowercase();
            let score = words.iter().filter(|w| text.contains(**w)).count();
            (score > 0).then_some((score, node.id.as_str()))
        })
        .collect();
    scored.sort_by(|a, b| b.cmp(a));
    scored.into_iter().take(10).map(|(_, id)| id.to_string()).collect()
}
