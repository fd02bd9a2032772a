//! Caller-facing graph operations over any [`GraphBackend`].
//!
//! Most calls pass straight through; the service adds id generation and a
//! few domain helpers (topic tree, task lookups, goal alignment) that only
//! need the backend primitives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::backend::GraphBackend;
use crate::error::{GraphError, Result};
use crate::models::{
    generate_node_id, Direction, Edge, EdgeSpec, GraphContext, GraphStats, Node, NodeQuery,
    NodeSpec, RepairReport, Schema, Traversal,
};

/// Nodes scanned by text search and the topic/task helpers.
pub const SCAN_CAP: usize = 1000;

/// Tasks returned by a status lookup.
pub const STATUS_CAP: usize = 500;

pub const DEFAULT_SEARCH_FIELDS: [&str; 2] = ["name", "description"];

/// A topic with its nested sub-topics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicTreeNode {
    #[serde(flatten)]
    pub node: Node,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TopicTreeNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlignmentSummary {
    pub project_count: usize,
    pub initiative_count: usize,
    pub task_count: usize,
}

/// Everything that feeds into one goal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalAlignment {
    pub goal: Node,
    pub projects: Vec<Node>,
    pub initiatives: Vec<Node>,
    pub tasks: Vec<Node>,
    pub summary: AlignmentSummary,
}

#[derive(Clone)]
pub struct GraphService {
    backend: Arc<dyn GraphBackend>,
}

impl GraphService {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Create a node, generating `{type}:{12 hex}` when no id is given.
    pub async fn create_node(
        &self,
        node_type: &str,
        data: Map<String, Value>,
        node_id: Option<&str>,
    ) -> Result<Node> {
        let node_id = match node_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => generate_node_id(node_type),
        };
        let node = self.backend.create_node(node_type, &node_id, data).await?;
        tracing::info!(event = "node_created", node_id = %node.id, node_type = %node.node_type, "Node created");
        Ok(node)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        self.backend.get_node(node_id).await
    }

    pub async fn update_node(&self, node_id: &str, data: Map<String, Value>, merge: bool) -> Result<Node> {
        self.backend.update_node(node_id, data, merge).await
    }

    pub async fn delete_node(&self, node_id: &str) -> Result<bool> {
        let deleted = self.backend.delete_node(node_id).await?;
        if deleted {
            tracing::info!(event = "node_deleted", node_id = %node_id, "Node deleted");
        }
        Ok(deleted)
    }

    pub async fn node_exists(&self, node_id: &str) -> Result<bool> {
        self.backend.node_exists(node_id).await
    }

    // ========================================================================
    // Edges
    // ========================================================================

    pub async fn create_edge(
        &self,
        from_id: &str,
        relation: &str,
        to_id: &str,
        data: Option<Map<String, Value>>,
    ) -> Result<Edge> {
        self.backend.create_edge(from_id, relation, to_id, data).await
    }

    pub async fn get_edges(&self, node_id: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<Edge>> {
        self.backend.get_edges(node_id, direction, relation).await
    }

    pub async fn delete_edge(&self, edge_id: &str) -> Result<bool> {
        self.backend.delete_edge(edge_id).await
    }

    /// Nodes on the far side of `node_id`'s edges, first-seen order.
    pub async fn get_related_nodes(
        &self,
        node_id: &str,
        relation: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Node>> {
        let edges = self.get_edges(node_id, direction, relation).await?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut related: Vec<String> = Vec::new();
        for edge in &edges {
            if direction.includes_outgoing() && edge.from_id == node_id && seen.insert(&edge.to_id) {
                related.push(edge.to_id.clone());
            }
            if direction.includes_incoming() && edge.to_id == node_id && seen.insert(&edge.from_id) {
                related.push(edge.from_id.clone());
            }
        }

        let mut found = self.backend.get_nodes(&related).await?;
        Ok(related.iter().filter_map(|id| found.remove(id)).collect())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>> {
        self.backend.query_nodes(query).await
    }

    pub async fn count_nodes(&self, node_type: Option<&str>, filters: Option<&Map<String, Value>>) -> Result<usize> {
        self.backend.count_nodes(node_type, filters).await
    }

    /// Case-insensitive substring search, best matches first.
    ///
    /// Each searched field scores 10 on an exact match, 5 on a prefix match
    /// and 1 when it merely contains the query. Only the newest
    /// [`SCAN_CAP`] nodes are considered.
    pub async fn search_nodes(
        &self,
        query: &str,
        node_type: Option<&str>,
        fields: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Node>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let default_fields: Vec<String> = DEFAULT_SEARCH_FIELDS.iter().map(|f| f.to_string()).collect();
        let fields = match fields {
            Some(f) if !f.is_empty() => f,
            _ => default_fields.as_slice(),
        };

        let candidates = self
            .query_nodes(&NodeQuery {
                node_type: node_type.map(str::to_string),
                limit: SCAN_CAP,
                ..NodeQuery::default()
            })
            .await?;

        let mut scored: Vec<(u32, Node)> = candidates
            .into_iter()
            .filter_map(|node| {
                let score: u32 = fields
                    .iter()
                    .filter_map(|field| field_text(&node, field))
                    .map(|value| match_score(&needle, &value.to_lowercase()))
                    .sum();
                (score > 0).then_some((score, node))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored.into_iter().take(limit).map(|(_, node)| node).collect())
    }

    // ========================================================================
    // Retrieval and bulk
    // ========================================================================

    pub async fn traverse(
        &self,
        start_id: &str,
        depth: usize,
        relations: Option<&[String]>,
        direction: Direction,
    ) -> Result<Traversal> {
        self.backend.traverse(start_id, depth, relations, direction).await
    }

    pub async fn get_subgraph(&self, node_id: &str, depth: usize, include_types: Option<&[String]>) -> Result<GraphContext> {
        self.backend.get_subgraph(node_id, depth, include_types).await
    }

    /// Fill missing ids, then delegate; skipped rows are not errors.
    pub async fn bulk_create_nodes(&self, mut specs: Vec<NodeSpec>) -> Result<Vec<Node>> {
        for spec in specs.iter_mut() {
            if spec.id.as_deref().map_or(true, str::is_empty) {
                let prefix = if spec.node_type.is_empty() { "node" } else { spec.node_type.as_str() };
                spec.id = Some(generate_node_id(prefix));
            }
        }
        let requested = specs.len();
        let created = self.backend.bulk_create_nodes(specs).await?;
        tracing::info!(event = "bulk_nodes", requested, created = created.len(), "Bulk node create finished");
        Ok(created)
    }

    pub async fn bulk_create_edges(&self, specs: Vec<EdgeSpec>) -> Result<Vec<Edge>> {
        let requested = specs.len();
        let created = self.backend.bulk_create_edges(specs).await?;
        tracing::info!(event = "bulk_edges", requested, created = created.len(), "Bulk edge create finished");
        Ok(created)
    }

    pub async fn get_schema(&self) -> Result<Schema> {
        self.backend.get_schema().await
    }

    pub async fn get_stats(&self) -> Result<GraphStats> {
        self.backend.get_stats().await
    }

    pub async fn repair(&self) -> Result<RepairReport> {
        let report = self.backend.repair().await?;
        tracing::info!(
            event = "repair",
            stale = report.stale_index_entries,
            unindexed = report.unindexed_nodes,
            dangling = report.dangling_edges_removed,
            "Repair pass finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Domain helpers
    // ========================================================================

    /// Topics nested by their `path` (`Work/Projects` is a child of `Work`).
    ///
    /// With `root_path`, only topics whose path starts with it are kept; a
    /// topic whose parent path is not among the kept topics becomes a root.
    pub async fn get_topic_hierarchy(&self, root_path: Option<&str>) -> Result<Vec<TopicTreeNode>> {
        let mut topics = self
            .query_nodes(&NodeQuery::of_type("Topic").limit(SCAN_CAP))
            .await?;
        if let Some(root) = root_path.filter(|r| !r.is_empty()) {
            topics.retain(|t| t.str_prop("path").unwrap_or_default().starts_with(root));
        }
        Ok(build_topic_tree(topics))
    }

    pub async fn get_tasks_by_status(&self, status: &str) -> Result<Vec<Node>> {
        self.query_nodes(
            &NodeQuery::of_type("Task")
                .with_filter("status", status)
                .limit(STATUS_CAP),
        )
        .await
    }

    /// Tasks whose `primary_topic` falls under the topic's path. Empty when
    /// the topic does not exist.
    pub async fn get_tasks_by_topic(&self, topic_id: &str) -> Result<Vec<Node>> {
        let Some(topic) = self.get_node(topic_id).await? else {
            return Ok(Vec::new());
        };
        let topic_path = topic.str_prop("path").unwrap_or_default().to_string();

        let mut tasks = self
            .query_nodes(&NodeQuery::of_type("Task").limit(SCAN_CAP))
            .await?;
        tasks.retain(|t| {
            t.str_prop("primary_topic")
                .unwrap_or_default()
                .starts_with(&topic_path)
        });
        Ok(tasks)
    }

    /// Projects supporting a goal, the goal's initiatives, and the tasks of
    /// those projects.
    pub async fn get_goal_alignment(&self, goal_id: &str) -> Result<GoalAlignment> {
        let goal = self
            .get_node(goal_id)
            .await?
            .ok_or_else(|| GraphError::NotFound {
                kind: "Goal",
                id: goal_id.to_string(),
            })?;

        let projects = self
            .get_related_nodes(goal_id, Some("supportsGoal"), Direction::Incoming)
            .await?;
        let initiatives = self
            .get_related_nodes(goal_id, Some("hasInitiative"), Direction::Outgoing)
            .await?;

        let mut tasks = Vec::new();
        for project in &projects {
            tasks.extend(
                self.get_related_nodes(&project.id, Some("hasTask"), Direction::Outgoing)
                    .await?,
            );
        }

        let summary = AlignmentSummary {
            project_count: projects.len(),
            initiative_count: initiatives.len(),
            task_count: tasks.len(),
        };
        Ok(GoalAlignment {
            goal,
            projects,
            initiatives,
            tasks,
            summary,
        })
    }
}

/// Text of a searchable field; `@id` and `@type` map to the fixed fields.
fn field_text<'a>(node: &'a Node, field: &str) -> Option<&'a str> {
    match field {
        "@id" => Some(node.id.as_str()),
        "@type" => Some(node.node_type.as_str()),
        _ => node.str_prop(field),
    }
}

fn match_score(needle: &str, value: &str) -> u32 {
    if value == needle {
        10
    } else if value.starts_with(needle) {
        5
    } else if value.contains(needle) {
        1
    } else {
        0
    }
}

fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn build_topic_tree(topics: Vec<Node>) -> Vec<TopicTreeNode> {
    // Later topics win a duplicated path, as a plain path lookup would.
    let by_path: HashMap<String, usize> = topics
        .iter()
        .enumerate()
        .map(|(i, t)| (t.str_prop("path").unwrap_or_default().to_string(), i))
        .collect();

    let mut roots = Vec::new();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); topics.len()];
    for (i, topic) in topics.iter().enumerate() {
        let parent = parent_path(topic.str_prop("path").unwrap_or_default())
            .and_then(|p| by_path.get(p))
            .filter(|&&p| p != i);
        match parent {
            Some(&p) => children[p].push(i),
            None => roots.push(i),
        }
    }

    let mut slots: Vec<Option<Node>> = topics.into_iter().map(Some).collect();
    roots
        .into_iter()
        .filter_map(|i| assemble(i, &children, &mut slots))
        .collect()
}

fn assemble(i: usize, children: &[Vec<usize>], slots: &mut [Option<Node>]) -> Option<TopicTreeNode> {
    let node = slots[i].take()?;
    let kids = children[i]
        .iter()
        .filter_map(|&c| assemble(c, children, slots))
        .collect();
    Some(TopicTreeNode { node, children: kids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlobFileBackend;
    use crate::blob::MemoryBlobStore;
    use crate::clock::Clock;
    use serde_json::json;

    fn service() -> GraphService {
        let store = Arc::new(MemoryBlobStore::new());
        let backend = BlobFileBackend::new(store, "graph/", Clock::from_name("UTC").unwrap());
        GraphService::new(Arc::new(backend))
    }

    fn data(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    // ========================================================================
    // TEST 1: Id generation
    // ========================================================================

    #[tokio::test]
    async fn test_create_node_generates_prefixed_id() {
        let svc = service();
        let node = svc.create_node("Goal", data(json!({"name": "Fit"})), None).await.unwrap();
        assert!(node.id.starts_with("goal:"));
        assert_eq!(node.id.len(), "goal:".len() + 12);

        let explicit = svc
            .create_node("Goal", Map::new(), Some("goal:custom"))
            .await
            .unwrap();
        assert_eq!(explicit.id, "goal:custom");
    }

    #[tokio::test]
    async fn test_bulk_fills_missing_ids() {
        let svc = service();
        let created = svc
            .bulk_create_nodes(vec![
                NodeSpec {
                    node_type: "Task".into(),
                    id: None,
                    data: data(json!({"name": "a"})),
                },
                NodeSpec::new("Task", "task:fixed", Map::new()),
            ])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().any(|n| n.id == "task:fixed"));
        assert!(created.iter().any(|n| n.id.starts_with("task:") && n.id != "task:fixed"));
    }

    // ========================================================================
    // TEST 2: Related nodes and search
    // ========================================================================

    #[tokio::test]
    async fn test_related_nodes_respect_direction() {
        let svc = service();
        for id in ["a", "b", "c"] {
            svc.create_node("Task", Map::new(), Some(id)).await.unwrap();
        }
        svc.create_edge("a", "dependsOn", "b", None).await.unwrap();
        svc.create_edge("c", "dependsOn", "a", None).await.unwrap();

        let out = svc.get_related_nodes("a", None, Direction::Outgoing).await.unwrap();
        assert_eq!(out.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["b"]);

        let inc = svc.get_related_nodes("a", Some("dependsOn"), Direction::Incoming).await.unwrap();
        assert_eq!(inc.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["c"]);

        let both = svc.get_related_nodes("a", None, Direction::Both).await.unwrap();
        assert_eq!(both.len(), 2);
    }

    #[tokio::test]
    async fn test_search_scores_exact_prefix_contains() {
        let svc = service();
        svc.create_node("Task", data(json!({"name": "release notes"})), Some("t:prefix"))
            .await
            .unwrap();
        svc.create_node("Task", data(json!({"name": "Release"})), Some("t:exact"))
            .await
            .unwrap();
        svc.create_node("Task", data(json!({"name": "pre-release", "description": "x"})), Some("t:inner"))
            .await
            .unwrap();
        svc.create_node("Task", data(json!({"name": "unrelated"})), Some("t:none"))
            .await
            .unwrap();

        let hits = svc.search_nodes("release", None, None, 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["t:exact", "t:prefix", "t:inner"]);

        let limited = svc.search_nodes("release", None, None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(svc.search_nodes("   ", None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_custom_fields_and_type() {
        let svc = service();
        svc.create_node("Person", data(json!({"name": "Ana", "email": "ana@x.org"})), Some("p:1"))
            .await
            .unwrap();
        svc.create_node("Task", data(json!({"name": "Email ana"})), Some("t:1"))
            .await
            .unwrap();

        let fields = vec!["email".to_string()];
        let hits = svc.search_nodes("ana@", Some("Person"), Some(&fields), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p:1");
    }

    // ========================================================================
    // TEST 3: Topic hierarchy
    // ========================================================================

    #[tokio::test]
    async fn test_topic_hierarchy_nests_by_path() {
        let svc = service();
        for (id, path) in [
            ("topic:work", "Work"),
            ("topic:work_projects", "Work/Projects"),
            ("topic:work_projects_alpha", "Work/Projects/Alpha"),
            ("topic:orphan", "Missing/Child"),
            ("topic:life", "Life"),
        ] {
            svc.create_node("Topic", data(json!({"name": path, "path": path})), Some(id))
                .await
                .unwrap();
        }

        let tree = svc.get_topic_hierarchy(None).await.unwrap();
        let root_ids: HashSet<&str> = tree.iter().map(|t| t.node.id.as_str()).collect();
        assert_eq!(root_ids, HashSet::from(["topic:work", "topic:orphan", "topic:life"]));

        let work = tree.iter().find(|t| t.node.id == "topic:work").unwrap();
        assert_eq!(work.children.len(), 1);
        assert_eq!(work.children[0].children[0].node.id, "topic:work_projects_alpha");

        let v = serde_json::to_value(work).unwrap();
        assert_eq!(v["@id"], "topic:work");
        assert_eq!(v["children"][0]["path"], "Work/Projects");
        assert!(v["children"][0]["children"][0].get("children").is_none());

        let scoped = svc.get_topic_hierarchy(Some("Work/Projects")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].node.id, "topic:work_projects");
    }

    // ========================================================================
    // TEST 4: Task lookups and goal alignment
    // ========================================================================

    #[tokio::test]
    async fn test_tasks_by_status_and_topic() {
        let svc = service();
        svc.create_node("Topic", data(json!({"path": "Work/Projects"})), Some("topic:wp"))
            .await
            .unwrap();
        svc.create_node(
            "Task",
            data(json!({"status": "pending", "primary_topic": "Work/Projects/Alpha"})),
            Some("task:1"),
        )
        .await
        .unwrap();
        svc.create_node("Task", data(json!({"status": "done", "primary_topic": "Life"})), Some("task:2"))
            .await
            .unwrap();

        let pending = svc.get_tasks_by_status("pending").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "task:1");

        let under = svc.get_tasks_by_topic("topic:wp").await.unwrap();
        assert_eq!(under.len(), 1);
        assert!(svc.get_tasks_by_topic("topic:missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_goal_alignment() {
        let svc = service();
        svc.create_node("Goal", Map::new(), Some("goal:g")).await.unwrap();
        svc.create_node("Project", Map::new(), Some("project:p")).await.unwrap();
        svc.create_node("Initiative", Map::new(), Some("init:i")).await.unwrap();
        svc.create_node("Task", Map::new(), Some("task:t1")).await.unwrap();
        svc.create_node("Task", Map::new(), Some("task:t2")).await.unwrap();
        svc.create_edge("project:p", "supportsGoal", "goal:g", None).await.unwrap();
        svc.create_edge("goal:g", "hasInitiative", "init:i", None).await.unwrap();
        svc.create_edge("project:p", "hasTask", "task:t1", None).await.unwrap();
        svc.create_edge("project:p", "hasTask", "task:t2", None).await.unwrap();

        let alignment = svc.get_goal_alignment("goal:g").await.unwrap();
        assert_eq!(alignment.summary.project_count, 1);
        assert_eq!(alignment.summary.initiative_count, 1);
        assert_eq!(alignment.summary.task_count, 2);

        let err = svc.get_goal_alignment("goal:nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
