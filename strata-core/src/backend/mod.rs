//! Storage backends behind one async trait.
//!
//! Backends implement the primitive operations; traversal, path finding and
//! the context builders are default methods over those primitives (see
//! [`traversal`]) so every backend answers retrieval queries the same way.

pub mod blob_file;
pub mod neo4j;
pub mod traversal;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::config::{BackendKind, StrataConfig};
use crate::error::{GraphError, Result};
use crate::models::{
    Direction, Edge, EdgeSpec, GraphContext, GraphPath, GraphStats, Node, NodeQuery, NodeSpec,
    RepairReport, Schema, Traversal,
};

pub use blob_file::BlobFileBackend;
pub use neo4j::Neo4jBackend;

#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Backend name for logging and stats.
    fn name(&self) -> &str;

    fn clock(&self) -> &Clock;

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn create_node(&self, node_type: &str, node_id: &str, data: Map<String, Value>) -> Result<Node>;

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>>;

    async fn update_node(&self, node_id: &str, data: Map<String, Value>, merge: bool) -> Result<Node>;

    /// Removes the node and every incident edge. `false` if it did not exist.
    async fn delete_node(&self, node_id: &str) -> Result<bool>;

    async fn node_exists(&self, node_id: &str) -> Result<bool>;

    /// Batched lookup; ids that do not resolve are absent from the map.
    async fn get_nodes(&self, node_ids: &[String]) -> Result<HashMap<String, Node>> {
        let mut found = HashMap::with_capacity(node_ids.len());
        for id in node_ids {
            if let Some(node) = self.get_node(id).await? {
                found.insert(id.clone(), node);
            }
        }
        Ok(found)
    }

    // ========================================================================
    // Edges
    // ========================================================================

    async fn create_edge(
        &self,
        from_id: &str,
        relation: &str,
        to_id: &str,
        data: Option<Map<String, Value>>,
    ) -> Result<Edge>;

    async fn get_edges(&self, node_id: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<Edge>>;

    async fn delete_edge(&self, edge_id: &str) -> Result<bool>;

    async fn delete_edges_for_node(&self, node_id: &str) -> Result<usize>;

    /// Incident edges for many nodes at once, keyed by node id.
    async fn edges_for_nodes(
        &self,
        node_ids: &[String],
        direction: Direction,
    ) -> Result<HashMap<String, Vec<Edge>>> {
        let mut out = HashMap::with_capacity(node_ids.len());
        for id in node_ids {
            out.insert(id.clone(), self.get_edges(id, direction, None).await?);
        }
        Ok(out)
    }

    /// Global scan for edges whose relation is in `relation_types`.
    async fn edges_by_relation(&self, relation_types: &[String], max_edges: usize) -> Result<Vec<Edge>>;

    // ========================================================================
    // Queries
    // ========================================================================

    /// Newest first by `created_at`, then paginated.
    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>>;

    async fn count_nodes(&self, node_type: Option<&str>, filters: Option<&Map<String, Value>>) -> Result<usize>;

    // ========================================================================
    // Retrieval (shared algorithms)
    // ========================================================================

    async fn traverse(
        &self,
        start_id: &str,
        depth: usize,
        relations: Option<&[String]>,
        direction: Direction,
    ) -> Result<Traversal> {
        traversal::breadth_first(self, start_id, depth, relations, direction).await
    }

    async fn get_subgraph(
        &self,
        node_id: &str,
        depth: usize,
        include_types: Option<&[String]>,
    ) -> Result<GraphContext> {
        traversal::subgraph(self, node_id, depth, include_types).await
    }

    async fn find_paths(
        &self,
        from_id: &str,
        to_id: &str,
        max_depth: usize,
        relations: Option<&[String]>,
    ) -> Result<Vec<GraphPath>> {
        traversal::simple_paths(self, from_id, to_id, max_depth, relations).await
    }

    async fn get_path_context(
        &self,
        node_ids: &[String],
        max_depth: usize,
        relations: Option<&[String]>,
    ) -> Result<GraphContext> {
        traversal::path_context(self, node_ids, max_depth, relations).await
    }

    async fn get_entity_context(
        &self,
        entity_ids: &[String],
        include_relations: bool,
        depth: usize,
    ) -> Result<GraphContext> {
        traversal::entity_context(self, entity_ids, include_relations, depth).await
    }

    async fn get_relation_context(&self, relation_types: &[String], limit: usize) -> Result<GraphContext> {
        traversal::relation_context(self, relation_types, limit).await
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Invalid, existing and in-batch duplicate specs are skipped.
    async fn bulk_create_nodes(&self, specs: Vec<NodeSpec>) -> Result<Vec<Node>>;

    /// Specs with a missing endpoint or empty field are skipped.
    async fn bulk_create_edges(&self, specs: Vec<EdgeSpec>) -> Result<Vec<Edge>>;

    // ========================================================================
    // Schema, stats, lifecycle
    // ========================================================================

    async fn get_schema(&self) -> Result<Schema>;

    async fn get_stats(&self) -> Result<GraphStats>;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn repair(&self) -> Result<RepairReport> {
        Ok(RepairReport::default())
    }
}

fn node_type_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").ok())
        .as_ref()
}

/// Node types become file names and database labels, so they are limited
/// to identifiers.
pub fn validate_node_type(node_type: &str) -> Result<()> {
    if node_type_pattern().is_some_and(|re| re.is_match(node_type)) {
        Ok(())
    } else {
        Err(GraphError::Validation(format!(
            "node type must be an identifier of at most 64 characters (got {:?})",
            node_type
        )))
    }
}

pub fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.trim().is_empty() {
        return Err(GraphError::Validation("node id must not be empty".to_string()));
    }
    Ok(())
}

// ============================================================================
// Provider
// ============================================================================

/// Hands out backends to request handlers.
///
/// Blob backends cache indexes for their own lifetime, so the server builds
/// one per request over the shared store. The database backend owns a
/// connection pool and is shared.
#[derive(Clone)]
pub enum BackendProvider {
    Shared(Arc<dyn GraphBackend>),
    PerRequest {
        store: Arc<dyn BlobStore>,
        prefix: String,
        clock: Clock,
    },
}

impl BackendProvider {
    pub async fn from_config(config: &StrataConfig, store: Arc<dyn BlobStore>) -> Result<Self> {
        let clock = Clock::from_name(&config.service.timezone)?;
        match config.backend.kind {
            BackendKind::Blob => Ok(BackendProvider::PerRequest {
                store,
                prefix: config.blob.prefix.clone(),
                clock,
            }),
            BackendKind::Neo4j => {
                let backend = Neo4jBackend::connect(&config.neo4j, clock).await?;
                Ok(BackendProvider::Shared(Arc::new(backend)))
            }
        }
    }

    pub fn backend(&self) -> Arc<dyn GraphBackend> {
        match self {
            BackendProvider::Shared(backend) => Arc::clone(backend),
            BackendProvider::PerRequest { store, prefix, clock } => {
                Arc::new(BlobFileBackend::new(Arc::clone(store), prefix, *clock))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendProvider::Shared(_) => "shared",
            BackendProvider::PerRequest { .. } => "per_request",
        }
    }
}

/// Build a single backend from config and run its `initialize`.
pub async fn create_backend(config: &StrataConfig, store: Arc<dyn BlobStore>) -> Result<Arc<dyn GraphBackend>> {
    let backend = BackendProvider::from_config(config, store).await?.backend();
    backend.initialize().await?;
    tracing::info!(backend = backend.name(), "Graph backend initialized");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn test_node_type_validation() {
        assert!(validate_node_type("Task").is_ok());
        assert!(validate_node_type("_internal2").is_ok());
        assert!(validate_node_type("").is_err());
        assert!(validate_node_type("../etc").is_err());
        assert!(validate_node_type("Has Space").is_err());
        assert!(validate_node_type(&"T".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn test_blob_provider_builds_fresh_backends() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let provider = BackendProvider::from_config(&StrataConfig::in_memory(), store)
            .await
            .unwrap();
        assert_eq!(provider.kind(), "per_request");

        let first = provider.backend();
        first
            .create_node("Task", "task:1", Map::new())
            .await
            .unwrap();

        // A second backend over the same store sees the persisted node.
        let second = provider.backend();
        assert!(second.node_exists("task:1").await.unwrap());
        assert_eq!(second.name(), "blob_jsonl");
    }
}
