//! Graph backend over JSON-Lines objects in a [`BlobStore`].
//!
//! ```text
//! <prefix>schema.json
//! <prefix>nodes/<type>.jsonl
//! <prefix>edges/relationships.jsonl
//! <prefix>indexes/node_index.json
//! <prefix>indexes/by_type.json
//! ```
//!
//! An instance caches indexes and parsed node files for its lifetime and
//! serializes its own operations. Writes carry the generation of the last
//! read, so two instances racing on the same object fail with
//! [`GraphError::Conflict`] instead of losing an update.

mod jsonl;
mod state;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use super::{validate_node_id, validate_node_type, GraphBackend};
use crate::blob::{BlobStore, Precondition, JSONL_CONTENT_TYPE, JSON_CONTENT_TYPE};
use crate::clock::{newest_first, Clock};
use crate::error::{GraphError, Result};
use crate::models::{
    Direction, Edge, EdgeSpec, GraphStats, Node, NodeQuery, NodeSpec, RepairReport, Schema,
};

use jsonl::{parse_document, parse_lines, render_document, render_lines};
use state::{EdgeIndex, GraphState, Layout, NodeIndexDoc, TypeIndexDoc};

pub const STORAGE_BACKEND: &str = "blob_jsonl";

type StateGuard<'a> = MutexGuard<'a, Option<GraphState>>;

pub struct BlobFileBackend {
    store: Arc<dyn BlobStore>,
    layout: Layout,
    clock: Clock,
    state: Mutex<Option<GraphState>>,
    schema: Mutex<Option<Schema>>,
}

fn edge_matches(edge: &Edge, node_id: &str, direction: Direction, relation: Option<&str>) -> bool {
    let direction_ok = match direction {
        Direction::Outgoing => edge.from_id == node_id,
        Direction::Incoming => edge.to_id == node_id,
        Direction::Both => true,
    };
    direction_ok && relation.map_or(true, |r| edge.relation == r)
}

impl BlobFileBackend {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str, clock: Clock) -> Self {
        Self {
            store,
            layout: Layout::new(prefix),
            clock,
            state: Mutex::new(None),
            schema: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        self.layout.prefix()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Lock the state, loading it on first use or after a failed write.
    async fn lock_state(&self) -> Result<StateGuard<'_>> {
        let mut guard = self.state.lock().await;
        if guard.as_ref().map_or(true, |st| st.stale) {
            *guard = Some(self.load_state().await?);
        }
        Ok(guard)
    }

    async fn read_text(&self, st: &mut GraphState, key: &str) -> Result<Option<String>> {
        match self.store.get(key).await? {
            Some(blob) => {
                let text = blob.text(key)?.to_string();
                st.generations.insert(key.to_string(), Some(blob.generation));
                Ok(Some(text))
            }
            None => {
                st.generations.insert(key.to_string(), None);
                Ok(None)
            }
        }
    }

    async fn load_state(&self) -> Result<GraphState> {
        let mut st = GraphState::default();

        let key = self.layout.node_index();
        if let Some(text) = self.read_text(&mut st, &key).await? {
            let doc: NodeIndexDoc = parse_document(&key, &text)?;
            st.node_index = doc.nodes.into_iter().collect();
        }

        let key = self.layout.type_index();
        match self.read_text(&mut st, &key).await? {
            Some(text) => {
                let doc: TypeIndexDoc = parse_document(&key, &text)?;
                st.type_index = doc.types;
            }
            None => st.rebuild_type_index(),
        }

        let key = self.layout.edges();
        if let Some(text) = self.read_text(&mut st, &key).await? {
            st.edges = EdgeIndex::from_edges(parse_lines(&key, &text)?);
        }

        tracing::debug!(
            prefix = self.layout.prefix(),
            nodes = st.node_index.len(),
            edges = st.edges.len(),
            "Loaded graph indexes"
        );
        Ok(st)
    }

    /// Parse a node file into the cache if it is not there yet.
    async fn ensure_file(&self, st: &mut GraphState, key: &str) -> Result<()> {
        if st.files.contains_key(key) {
            return Ok(());
        }
        let nodes = match self.read_text(st, key).await? {
            Some(text) => parse_lines(key, &text)?,
            None => Vec::new(),
        };
        st.files.insert(key.to_string(), nodes);
        Ok(())
    }

    // ========================================================================
    // Writing
    // ========================================================================

    async fn put_tracked(&self, st: &mut GraphState, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let observed = st.generations.get(key).copied().flatten();
        match self
            .store
            .put(key, data, content_type, Precondition::from_observed(observed))
            .await
        {
            Ok(generation) => {
                st.generations.insert(key.to_string(), Some(generation));
                Ok(())
            }
            Err(e) => {
                st.stale = true;
                match &e {
                    GraphError::Conflict { .. } => {
                        tracing::warn!(path = key, "Concurrent write detected; dropping cached state")
                    }
                    _ => tracing::error!(path = key, error = %e, "Failed to write graph object"),
                }
                Err(e)
            }
        }
    }

    async fn flush_file(&self, st: &mut GraphState, key: &str) -> Result<()> {
        let data = render_lines(st.files.get(key).into_iter().flatten())?;
        self.put_tracked(st, key, data, JSONL_CONTENT_TYPE).await
    }

    async fn flush_edges(&self, st: &mut GraphState) -> Result<()> {
        let data = render_lines(st.edges.iter())?;
        let key = self.layout.edges();
        self.put_tracked(st, &key, data, JSONL_CONTENT_TYPE).await
    }

    async fn flush_indexes(&self, st: &mut GraphState) -> Result<()> {
        let data = render_document(&st.node_index_doc())?;
        let key = self.layout.node_index();
        self.put_tracked(st, &key, data, JSON_CONTENT_TYPE).await?;

        let data = render_document(&st.type_index_doc())?;
        let key = self.layout.type_index();
        self.put_tracked(st, &key, data, JSON_CONTENT_TYPE).await
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Indexed nodes of `node_type` (or every type) matching `filters`, in
    /// file order.
    async fn scan_nodes(
        &self,
        st: &mut GraphState,
        node_type: Option<&str>,
        filters: &Map<String, Value>,
    ) -> Result<Vec<Node>> {
        let files: BTreeSet<String> = st
            .node_index
            .values()
            .filter(|loc| node_type.map_or(true, |t| loc.node_type == t))
            .map(|loc| loc.file.clone())
            .collect();

        let mut out = Vec::new();
        for file in &files {
            self.ensure_file(st, file).await?;
            for node in st.files.get(file).into_iter().flatten() {
                let indexed_here = st.node_index.get(&node.id).is_some_and(|loc| &loc.file == file);
                if indexed_here
                    && node_type.map_or(true, |t| node.node_type == t)
                    && node.matches(filters)
                {
                    out.push(node.clone());
                }
            }
        }
        Ok(out)
    }

    async fn lookup(&self, st: &mut GraphState, node_id: &str) -> Result<Option<Node>> {
        let file = match st.node_index.get(node_id) {
            Some(loc) => loc.file.clone(),
            None => return Ok(None),
        };
        self.ensure_file(st, &file).await?;
        Ok(st
            .files
            .get(&file)
            .and_then(|nodes| nodes.iter().find(|n| n.id == node_id))
            .cloned())
    }

    async fn read_schema(&self, key: &str) -> Result<Option<Schema>> {
        match self.store.get(key).await? {
            Some(blob) => Ok(Some(parse_document(key, blob.text(key)?)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl GraphBackend for BlobFileBackend {
    fn name(&self) -> &str {
        STORAGE_BACKEND
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }

    async fn create_node(&self, node_type: &str, node_id: &str, data: Map<String, Value>) -> Result<Node> {
        validate_node_type(node_type)?;
        validate_node_id(node_id)?;

        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        if st.node_index.contains_key(node_id) {
            return Err(GraphError::AlreadyExists(node_id.to_string()));
        }

        let file = self.layout.node_file(node_type);
        self.ensure_file(st, &file).await?;
        let node = Node::new(node_type, node_id, &self.clock.now(), data);
        st.place_node(&file, node.clone());
        self.flush_file(st, &file).await?;

        st.index_node(&node, &file);
        self.flush_indexes(st).await?;

        tracing::debug!(event = "node_created", node_id = %node.id, node_type = %node.node_type, "Node created");
        Ok(node)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        self.lookup(st, node_id).await
    }

    async fn get_nodes(&self, node_ids: &[String]) -> Result<HashMap<String, Node>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let mut found = HashMap::with_capacity(node_ids.len());
        for id in node_ids {
            if let Some(node) = self.lookup(st, id).await? {
                found.insert(id.clone(), node);
            }
        }
        Ok(found)
    }

    async fn update_node(&self, node_id: &str, data: Map<String, Value>, merge: bool) -> Result<Node> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let file = match st.node_index.get(node_id) {
            Some(loc) => loc.file.clone(),
            None => return Err(GraphError::node_not_found(node_id)),
        };
        self.ensure_file(st, &file).await?;

        let now = self.clock.now();
        let updated = {
            let node = st
                .files
                .get_mut(&file)
                .and_then(|nodes| nodes.iter_mut().find(|n| n.id == node_id))
                .ok_or_else(|| GraphError::node_not_found(node_id))?;
            node.apply_update(data, merge, &now);
            node.clone()
        };
        self.flush_file(st, &file).await?;

        tracing::debug!(event = "node_updated", node_id = node_id, merge = merge, "Node updated");
        Ok(updated)
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let file = match st.node_index.get(node_id) {
            Some(loc) => loc.file.clone(),
            None => return Ok(false),
        };

        // Edges first: a failure past this point leaves a node without
        // edges, never an edge pointing at a missing node.
        let removed = st.edges.remove_incident(node_id);
        if !removed.is_empty() {
            self.flush_edges(st).await?;
        }

        self.ensure_file(st, &file).await?;
        let changed = match st.files.get_mut(&file) {
            Some(nodes) => {
                let before = nodes.len();
                nodes.retain(|n| n.id != node_id);
                nodes.len() != before
            }
            None => false,
        };
        if changed {
            self.flush_file(st, &file).await?;
        }

        st.unindex_node(node_id);
        self.flush_indexes(st).await?;

        tracing::debug!(
            event = "node_deleted",
            node_id = node_id,
            edges_removed = removed.len(),
            "Node deleted"
        );
        Ok(true)
    }

    async fn node_exists(&self, node_id: &str) -> Result<bool> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        Ok(st.node_index.contains_key(node_id))
    }

    async fn create_edge(
        &self,
        from_id: &str,
        relation: &str,
        to_id: &str,
        data: Option<Map<String, Value>>,
    ) -> Result<Edge> {
        if relation.trim().is_empty() {
            return Err(GraphError::Validation("relation must not be empty".to_string()));
        }

        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        for id in [from_id, to_id] {
            if !st.node_index.contains_key(id) {
                return Err(GraphError::node_not_found(id));
            }
        }

        let edge = Edge::new(from_id, relation, to_id, &self.clock.now(), data);
        st.edges.insert(edge.clone());
        self.flush_edges(st).await?;

        tracing::debug!(event = "edge_created", edge_id = %edge.id, relation = relation, "Edge created");
        Ok(edge)
    }

    async fn get_edges(&self, node_id: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<Edge>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        Ok(st
            .edges
            .incident(node_id)
            .filter(|e| edge_matches(e, node_id, direction, relation))
            .cloned()
            .collect())
    }

    async fn edges_for_nodes(
        &self,
        node_ids: &[String],
        direction: Direction,
    ) -> Result<HashMap<String, Vec<Edge>>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        Ok(node_ids
            .iter()
            .map(|id| {
                let edges = st
                    .edges
                    .incident(id)
                    .filter(|e| edge_matches(e, id, direction, None))
                    .cloned()
                    .collect();
                (id.clone(), edges)
            })
            .collect())
    }

    async fn delete_edge(&self, edge_id: &str) -> Result<bool> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        if st.edges.remove(edge_id).is_none() {
            return Ok(false);
        }
        self.flush_edges(st).await?;
        Ok(true)
    }

    async fn delete_edges_for_node(&self, node_id: &str) -> Result<usize> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let removed = st.edges.remove_incident(node_id);
        if !removed.is_empty() {
            self.flush_edges(st).await?;
        }
        Ok(removed.len())
    }

    async fn edges_by_relation(&self, relation_types: &[String], max_edges: usize) -> Result<Vec<Edge>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        Ok(st
            .edges
            .iter()
            .filter(|e| relation_types.iter().any(|r| r == &e.relation))
            .take(max_edges)
            .cloned()
            .collect())
    }

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let mut nodes = self
            .scan_nodes(st, query.node_type.as_deref(), &query.filters)
            .await?;
        nodes.sort_by(|a, b| newest_first(&a.created_at, &b.created_at));
        Ok(nodes
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count_nodes(&self, node_type: Option<&str>, filters: Option<&Map<String, Value>>) -> Result<usize> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        match filters.filter(|f| !f.is_empty()) {
            None => Ok(match node_type {
                Some(t) => st.type_index.get(t).map_or(0, |ids| ids.len()),
                None => st.node_index.len(),
            }),
            Some(filters) => Ok(self.scan_nodes(st, node_type, filters).await?.len()),
        }
    }

    async fn bulk_create_nodes(&self, specs: Vec<NodeSpec>) -> Result<Vec<Node>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let now = self.clock.now();

        let mut created = Vec::new();
        let mut touched = BTreeSet::new();
        let mut skipped = 0usize;
        for spec in specs {
            let id = match spec.id {
                Some(id) if validate_node_id(&id).is_ok() => id,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            // The index grows as we go, so in-batch repeats are caught here too.
            if validate_node_type(&spec.node_type).is_err() || st.node_index.contains_key(&id) {
                skipped += 1;
                continue;
            }

            let file = self.layout.node_file(&spec.node_type);
            self.ensure_file(st, &file).await?;
            let node = Node::new(&spec.node_type, &id, &now, spec.data);
            st.place_node(&file, node.clone());
            st.index_node(&node, &file);
            touched.insert(file);
            created.push(node);
        }

        for file in &touched {
            self.flush_file(st, file).await?;
        }
        if !created.is_empty() {
            self.flush_indexes(st).await?;
        }

        tracing::info!(
            event = "bulk_nodes_created",
            created = created.len(),
            skipped = skipped,
            files = touched.len(),
            "Bulk node import finished"
        );
        Ok(created)
    }

    async fn bulk_create_edges(&self, specs: Vec<EdgeSpec>) -> Result<Vec<Edge>> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let now = self.clock.now();

        let mut created = Vec::new();
        let mut skipped = 0usize;
        for spec in specs {
            if !spec.is_complete()
                || !st.node_index.contains_key(&spec.from_id)
                || !st.node_index.contains_key(&spec.to_id)
            {
                skipped += 1;
                continue;
            }
            let edge = Edge::new(&spec.from_id, &spec.relation, &spec.to_id, &now, spec.data);
            st.edges.insert(edge.clone());
            created.push(edge);
        }

        if !created.is_empty() {
            self.flush_edges(st).await?;
        }

        tracing::info!(
            event = "bulk_edges_created",
            created = created.len(),
            skipped = skipped,
            "Bulk edge import finished"
        );
        Ok(created)
    }

    async fn get_schema(&self) -> Result<Schema> {
        let mut cached = self.schema.lock().await;
        if let Some(schema) = cached.as_ref() {
            return Ok(schema.clone());
        }

        let key = self.layout.schema();
        let schema = match self.read_schema(&key).await? {
            Some(schema) => schema,
            None => {
                let schema = Schema::default();
                let data = render_document(&schema)?;
                match self
                    .store
                    .put(&key, data, JSON_CONTENT_TYPE, Precondition::DoesNotExist)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(path = %key, "Created default schema");
                        schema
                    }
                    // Someone else created it first; theirs wins.
                    Err(GraphError::Conflict { .. }) => self.read_schema(&key).await?.unwrap_or(schema),
                    Err(e) => return Err(e),
                }
            }
        };

        *cached = Some(schema.clone());
        Ok(schema)
    }

    async fn get_stats(&self) -> Result<GraphStats> {
        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);

        let mut details = Map::new();
        details.insert("store".into(), json!(self.store.name()));
        details.insert("location".into(), json!(self.store.location()));
        details.insert("prefix".into(), json!(self.layout.prefix()));

        Ok(GraphStats {
            total_nodes: st.node_index.len(),
            total_edges: st.edges.len(),
            nodes_by_type: st
                .type_index
                .iter()
                .map(|(t, ids)| (t.clone(), ids.len()))
                .collect(),
            storage_backend: STORAGE_BACKEND.to_string(),
            details,
        })
    }

    async fn initialize(&self) -> Result<()> {
        self.get_schema().await?;

        let mut guard = self.lock_state().await?;
        let st = guard.get_or_insert_with(GraphState::default);
        let missing = [self.layout.node_index(), self.layout.type_index()]
            .iter()
            .any(|key| st.generations.get(key).copied().flatten().is_none());
        if missing {
            self.flush_indexes(st).await?;
            tracing::info!(prefix = self.layout.prefix(), "Created graph index files");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock().await = None;
        *self.schema.lock().await = None;
        Ok(())
    }

    async fn repair(&self) -> Result<RepairReport> {
        let mut guard = self.state.lock().await;
        *guard = Some(self.load_state().await?);
        let st = guard.get_or_insert_with(GraphState::default);

        let keys = self.store.list(&self.layout.nodes_dir()).await?;
        let mut rebuilt = HashMap::new();
        for key in keys.iter().filter(|k| k.ends_with(".jsonl")) {
            self.ensure_file(st, key).await?;
            for node in st.files.get(key).into_iter().flatten() {
                rebuilt
                    .entry(node.id.clone())
                    .or_insert_with(|| state::NodeLocation {
                        node_type: node.node_type.clone(),
                        file: key.clone(),
                    });
            }
        }

        let stale_index_entries = st.node_index.keys().filter(|id| !rebuilt.contains_key(*id)).count();
        let unindexed_nodes = rebuilt.keys().filter(|id| !st.node_index.contains_key(*id)).count();
        let index_changed = rebuilt != st.node_index;

        let dangling = st
            .edges
            .remove_where(|e| !rebuilt.contains_key(&e.from_id) || !rebuilt.contains_key(&e.to_id));
        if !dangling.is_empty() {
            self.flush_edges(st).await?;
        }

        let indexed_nodes = rebuilt.len();
        if index_changed {
            st.node_index = rebuilt;
            st.rebuild_type_index();
            self.flush_indexes(st).await?;
        }

        let report = RepairReport {
            indexed_nodes,
            stale_index_entries,
            unindexed_nodes,
            dangling_edges_removed: dangling.len(),
        };
        tracing::info!(
            event = "graph_repaired",
            indexed_nodes = report.indexed_nodes,
            stale_index_entries = report.stale_index_entries,
            unindexed_nodes = report.unindexed_nodes,
            dangling_edges_removed = report.dangling_edges_removed,
            "Repair pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::models::PathStep;

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn backend(store: &Arc<MemoryBlobStore>) -> BlobFileBackend {
        BlobFileBackend::new(store.clone(), "graph/", Clock::default())
    }

    async fn object(store: &MemoryBlobStore, key: &str) -> Value {
        let blob = store.get(key).await.unwrap().unwrap();
        serde_json::from_slice(&blob.data).unwrap()
    }

    async fn lines(store: &MemoryBlobStore, key: &str) -> Vec<Value> {
        let blob = store.get(key).await.unwrap().unwrap();
        parse_lines(key, std::str::from_utf8(&blob.data).unwrap()).unwrap()
    }

    /// a -> b -> d, a -> c -> d, d -> e
    async fn diamond(g: &BlobFileBackend) {
        for id in ["a", "b", "c", "d", "e"] {
            g.create_node("Task", id, props(json!({"name": id.to_uppercase()})))
                .await
                .unwrap();
        }
        for (from, to) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")] {
            g.create_edge(from, "dependsOn", to, None).await.unwrap();
        }
    }

    // ========================================================================
    // TEST 1: Create writes the node file and both indexes
    // ========================================================================
    #[tokio::test]
    async fn test_create_node_persists_layout() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.create_node("Task", "task:1", props(json!({"name": "Write report"})))
            .await
            .unwrap();

        let rows = lines(&store, "graph/nodes/task.jsonl").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["@id"], "task:1");
        assert_eq!(rows[0]["name"], "Write report");

        let index = object(&store, "graph/indexes/node_index.json").await;
        assert_eq!(index["nodes"]["task:1"]["type"], "Task");
        assert_eq!(index["nodes"]["task:1"]["file"], "graph/nodes/task.jsonl");

        let by_type = object(&store, "graph/indexes/by_type.json").await;
        assert_eq!(by_type["types"]["Task"], json!(["task:1"]));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_even_across_types() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.create_node("Task", "x:1", Map::new()).await.unwrap();
        let err = g.create_node("Goal", "x:1", Map::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::AlreadyExists(_)));
        assert_eq!(g.count_nodes(None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_type_rejected() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        let err = g.create_node("../evil", "x", Map::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    // ========================================================================
    // TEST 2: Update merges or replaces
    // ========================================================================
    #[tokio::test]
    async fn test_update_merge_and_replace() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        let created = g
            .create_node("Task", "task:1", props(json!({"name": "a", "status": "pending"})))
            .await
            .unwrap();

        let merged = g
            .update_node("task:1", props(json!({"status": "done"})), true)
            .await
            .unwrap();
        assert_eq!(merged.str_prop("name"), Some("a"));
        assert_eq!(merged.str_prop("status"), Some("done"));
        assert_eq!(merged.created_at, created.created_at);

        let replaced = g
            .update_node("task:1", props(json!({"priority": "high"})), false)
            .await
            .unwrap();
        assert!(replaced.get("name").is_none());
        assert_eq!(replaced.node_type, "Task");

        // Persisted, not just cached.
        let fresh = backend(&store);
        let stored = fresh.get_node("task:1").await.unwrap().unwrap();
        assert_eq!(stored.str_prop("priority"), Some("high"));

        let missing = g.update_node("task:404", Map::new(), true).await.unwrap_err();
        assert!(matches!(missing, GraphError::NotFound { .. }));
    }

    // ========================================================================
    // TEST 3: Delete cascades to incident edges
    // ========================================================================
    #[tokio::test]
    async fn test_delete_node_cascades() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;

        assert!(g.delete_node("d").await.unwrap());
        assert!(!g.delete_node("d").await.unwrap());

        let fresh = backend(&store);
        assert!(fresh.get_node("d").await.unwrap().is_none());
        let remaining = lines(&store, "graph/edges/relationships.jsonl").await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e["from_id"] != "d" && e["to_id"] != "d"));
        assert_eq!(fresh.count_nodes(Some("Task"), None).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_edge_requires_both_endpoints() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.create_node("Task", "a", Map::new()).await.unwrap();
        let err = g.create_edge("a", "dependsOn", "ghost", None).await.unwrap_err();
        match err {
            GraphError::NotFound { id, .. } => assert_eq!(id, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.get("graph/edges/relationships.jsonl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_edges_direction_and_relation() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;
        g.create_edge("d", "relatedTo", "a", None).await.unwrap();

        assert_eq!(g.get_edges("d", Direction::Outgoing, None).await.unwrap().len(), 2);
        assert_eq!(g.get_edges("d", Direction::Incoming, None).await.unwrap().len(), 2);
        assert_eq!(g.get_edges("d", Direction::Both, None).await.unwrap().len(), 4);
        let related = g
            .get_edges("d", Direction::Both, Some("relatedTo"))
            .await
            .unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].to_id, "a");

        assert_eq!(g.delete_edges_for_node("a").await.unwrap(), 3);
        assert!(!g.delete_edge("edge:missing").await.unwrap());
    }

    // ========================================================================
    // TEST 4: Query ordering, filters, pagination and count agreement
    // ========================================================================
    #[tokio::test]
    async fn test_query_newest_first_with_filters() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        for (i, status) in ["pending", "done", "pending", "pending"].iter().enumerate() {
            g.create_node("Task", &format!("task:{i}"), props(json!({"status": status})))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        g.create_node("Goal", "goal:1", props(json!({"status": "pending"})))
            .await
            .unwrap();

        let pending = g
            .query_nodes(&NodeQuery::of_type("Task").with_filter("status", "pending"))
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["task:3", "task:2", "task:0"]);

        let page = g
            .query_nodes(&NodeQuery::of_type("Task").limit(2).offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "task:2");

        let filters = props(json!({"status": "pending"}));
        assert_eq!(g.count_nodes(Some("Task"), Some(&filters)).await.unwrap(), 3);
        assert_eq!(g.count_nodes(None, Some(&filters)).await.unwrap(), 4);
        assert_eq!(g.count_nodes(None, None).await.unwrap(), 5);
        assert_eq!(
            g.query_nodes(&NodeQuery::default()).await.unwrap().len(),
            g.count_nodes(None, None).await.unwrap()
        );
        assert_eq!(g.count_nodes(Some("Person"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_case_variant_types_share_a_file_but_not_results() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.create_node("Task", "t:1", Map::new()).await.unwrap();
        g.create_node("TASK", "t:2", Map::new()).await.unwrap();

        assert_eq!(lines(&store, "graph/nodes/task.jsonl").await.len(), 2);
        let upper = g.query_nodes(&NodeQuery::of_type("TASK")).await.unwrap();
        assert_eq!(upper.len(), 1);
        assert_eq!(upper[0].id, "t:2");
        assert_eq!(g.count_nodes(Some("Task"), None).await.unwrap(), 1);
    }

    // ========================================================================
    // TEST 5: Traversal
    // ========================================================================
    #[tokio::test]
    async fn test_traverse_depths_and_filters() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;

        let zero = g.traverse("b", 0, None, Direction::Both).await.unwrap();
        assert_eq!(zero.node_count, 1);
        assert_eq!(zero.edge_count, 0);

        let one = g.traverse("b", 1, None, Direction::Both).await.unwrap();
        let mut ids: Vec<&str> = one.nodes.iter().map(|n| n.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "d"]);
        assert_eq!(one.edge_count, 2);

        let out = g.traverse("a", 5, None, Direction::Outgoing).await.unwrap();
        assert_eq!(out.node_count, 5);
        // Every edge recorded once even though d is reached twice.
        assert_eq!(out.edge_count, 5);

        let incoming = g.traverse("a", 3, None, Direction::Incoming).await.unwrap();
        assert_eq!(incoming.node_count, 1);

        let none = g
            .traverse("a", 3, Some(&["hasTopic".to_string()]), Direction::Both)
            .await
            .unwrap();
        assert_eq!(none.node_count, 1);

        let missing = g.traverse("ghost", 2, None, Direction::Both).await.unwrap();
        assert_eq!(missing.node_count, 0);
    }

    // ========================================================================
    // TEST 6: Path finding keeps alternate branches
    // ========================================================================
    #[tokio::test]
    async fn test_diamond_yields_both_paths() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;
        g.create_edge("d", "relatedTo", "a", None).await.unwrap();

        let paths = g.find_paths("a", "e", 3, None).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.hop_count() == 3));
        let via: Vec<&str> = paths
            .iter()
            .map(|p| p.nodes().nth(1).unwrap().id.as_str())
            .collect();
        assert!(via.contains(&"b") && via.contains(&"c"));

        assert!(g.find_paths("a", "e", 2, None).await.unwrap().is_empty());
        assert!(g.find_paths("e", "a", 4, None).await.unwrap().is_empty());
        let only_related = g
            .find_paths("a", "d", 3, Some(&["relatedTo".to_string()]))
            .await
            .unwrap();
        assert!(only_related.is_empty());

        let same = g.find_paths("a", "a", 3, None).await.unwrap();
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].items.len(), 1);
    }

    #[tokio::test]
    async fn test_path_context_merges_pairs() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;

        let ids = vec!["a".to_string(), "d".to_string(), "e".to_string()];
        let ctx = g.get_path_context(&ids, 3, None).await.unwrap();
        // a->d: 2, a->e: 2, d->e: 1
        assert_eq!(ctx.meta["path_count"], 5);
        assert_eq!(ctx.graph.len(), 5);
        assert_eq!(ctx.edges.len(), 5);
        let paths = ctx.paths.as_ref().unwrap();
        assert_eq!(paths[0].from, "a");
        assert!(matches!(paths[0].steps[0], PathStep::Node { .. }));
        assert_eq!(ctx.meta["query_nodes"], json!(["a", "d", "e"]));
    }

    // ========================================================================
    // TEST 7: Entity, relation and subgraph contexts
    // ========================================================================
    #[tokio::test]
    async fn test_entity_and_relation_contexts() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;
        g.create_node("Topic", "topic:work", Map::new()).await.unwrap();
        g.create_edge("a", "hasTopic", "topic:work", None).await.unwrap();

        let entity = g
            .get_entity_context(&["b".to_string()], false, 1)
            .await
            .unwrap();
        assert_eq!(entity.graph.len(), 3);
        assert!(entity.edges.is_empty());
        assert_eq!(entity.meta["retrieval_type"], "entity");

        let relation = g
            .get_relation_context(&["hasTopic".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(relation.edges.len(), 1);
        assert_eq!(relation.graph.len(), 2);
        assert_eq!(relation.meta["edge_count"], 1);

        let capped = g
            .get_relation_context(&["dependsOn".to_string()], 2)
            .await
            .unwrap();
        assert_eq!(capped.edges.len(), 2);
    }

    #[tokio::test]
    async fn test_subgraph_type_filter_prunes_edges() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;
        g.create_node("Topic", "topic:work", Map::new()).await.unwrap();
        g.create_edge("a", "hasTopic", "topic:work", None).await.unwrap();

        let all = g.get_subgraph("a", 1, None).await.unwrap();
        assert_eq!(all.graph.len(), 4);
        assert_eq!(all.meta["focal_node"], "a");
        assert_eq!(all.context["@vocab"], "https://schema.org/");

        let topics = g
            .get_subgraph("a", 1, Some(&["Topic".to_string()]))
            .await
            .unwrap();
        assert_eq!(topics.graph.len(), 1);
        assert!(topics.edges.is_empty());
    }

    // ========================================================================
    // TEST 8: Bulk operations skip bad rows and write once
    // ========================================================================
    #[tokio::test]
    async fn test_bulk_partial_success() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.create_node("Task", "task:existing", Map::new()).await.unwrap();

        let created = g
            .bulk_create_nodes(vec![
                NodeSpec::new("Task", "task:1", Map::new()),
                NodeSpec::new("Task", "task:1", Map::new()),
                NodeSpec::new("Task", "task:existing", Map::new()),
                NodeSpec::new("", "task:2", Map::new()),
                NodeSpec { id: None, ..NodeSpec::new("Task", "unused", Map::new()) },
                NodeSpec::new("Goal", "goal:1", Map::new()),
            ])
            .await
            .unwrap();
        let ids: Vec<&str> = created.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["task:1", "goal:1"]);

        let edges = g
            .bulk_create_edges(vec![
                EdgeSpec::new("task:1", "supportsGoal", "goal:1"),
                EdgeSpec::new("task:1", "supportsGoal", "goal:404"),
                EdgeSpec::new("task:1", "", "goal:1"),
            ])
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);

        let fresh = backend(&store);
        assert_eq!(fresh.count_nodes(None, None).await.unwrap(), 3);
        assert_eq!(lines(&store, "graph/nodes/task.jsonl").await.len(), 2);
    }

    // ========================================================================
    // TEST 9: Malformed lines surface as Corrupt
    // ========================================================================
    #[tokio::test]
    async fn test_corrupt_node_file() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.create_node("Task", "task:1", Map::new()).await.unwrap();

        let blob = store.get("graph/nodes/task.jsonl").await.unwrap().unwrap();
        let mut text = String::from_utf8(blob.data.to_vec()).unwrap();
        text.push_str("\n{not json\n");
        store.insert("graph/nodes/task.jsonl", text).await;

        let fresh = backend(&store);
        match fresh.get_node("task:1").await.unwrap_err() {
            GraphError::Corrupt { path, line, .. } => {
                assert_eq!(path, "graph/nodes/task.jsonl");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // ========================================================================
    // TEST 10: Two writers on one store
    // ========================================================================
    #[tokio::test]
    async fn test_stale_writer_gets_conflict_then_recovers() {
        let store = Arc::new(MemoryBlobStore::new());
        let first = backend(&store);
        let second = backend(&store);
        first.initialize().await.unwrap();
        assert!(!second.node_exists("goal:1").await.unwrap());

        first.create_node("Task", "task:1", Map::new()).await.unwrap();
        let err = second.create_node("Goal", "goal:1", Map::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::Conflict { .. }));

        // The failed write dropped the cache; a retry sees the other node.
        second.create_node("Goal", "goal:1", Map::new()).await.unwrap();
        let fresh = backend(&store);
        assert!(fresh.node_exists("task:1").await.unwrap());
        assert!(fresh.node_exists("goal:1").await.unwrap());
        assert_eq!(lines(&store, "graph/nodes/goal.jsonl").await.len(), 1);
    }

    // ========================================================================
    // TEST 11: Repair rebuilds indexes and drops dangling edges
    // ========================================================================
    #[tokio::test]
    async fn test_repair_rebuilds_from_node_files() {
        let store = Arc::new(MemoryBlobStore::new());
        store
            .insert(
                "graph/nodes/task.jsonl",
                "{\"@type\":\"Task\",\"@id\":\"task:1\",\"created_at\":\"t0\"}\n\
                 {\"@type\":\"Task\",\"@id\":\"task:2\",\"created_at\":\"t0\"}\n",
            )
            .await;
        store
            .insert(
                "graph/indexes/node_index.json",
                "{\"nodes\":{\"task:1\":{\"type\":\"Task\",\"file\":\"graph/nodes/task.jsonl\"},\
                 \"task:9\":{\"type\":\"Task\",\"file\":\"graph/nodes/task.jsonl\"}}}",
            )
            .await;
        store
            .insert(
                "graph/edges/relationships.jsonl",
                "{\"@id\":\"edge:1\",\"from_id\":\"task:1\",\"relation\":\"dependsOn\",\"to_id\":\"task:2\"}\n\
                 {\"@id\":\"edge:2\",\"from_id\":\"task:1\",\"relation\":\"dependsOn\",\"to_id\":\"task:9\"}\n",
            )
            .await;

        let g = backend(&store);
        let report = g.repair().await.unwrap();
        assert_eq!(report.indexed_nodes, 2);
        assert_eq!(report.stale_index_entries, 1);
        assert_eq!(report.unindexed_nodes, 1);
        assert_eq!(report.dangling_edges_removed, 1);

        let by_type = object(&store, "graph/indexes/by_type.json").await;
        assert_eq!(by_type["types"]["Task"], json!(["task:1", "task:2"]));
        assert_eq!(lines(&store, "graph/edges/relationships.jsonl").await.len(), 1);

        let again = backend(&store).repair().await.unwrap();
        assert_eq!(again.stale_index_entries + again.unindexed_nodes + again.dangling_edges_removed, 0);
    }

    // ========================================================================
    // TEST 12: Lifecycle, schema and stats
    // ========================================================================
    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        g.initialize().await.unwrap();
        let index_gen = store
            .get("graph/indexes/node_index.json")
            .await
            .unwrap()
            .unwrap()
            .generation;
        let schema = object(&store, "graph/schema.json").await;
        assert_eq!(schema["version"], "1.0");

        g.initialize().await.unwrap();
        backend(&store).initialize().await.unwrap();
        let after = store
            .get("graph/indexes/node_index.json")
            .await
            .unwrap()
            .unwrap()
            .generation;
        assert_eq!(index_gen, after);

        g.close().await.unwrap();
        g.close().await.unwrap();
        assert_eq!(g.count_nodes(None, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_existing_schema_is_read_not_replaced() {
        let store = Arc::new(MemoryBlobStore::new());
        store
            .insert(
                "graph/schema.json",
                "{\"@context\":{\"@vocab\":\"https://example.org/\"},\"version\":\"2.0\",\"owner\":\"ops\"}",
            )
            .await;
        let schema = backend(&store).get_schema().await.unwrap();
        assert_eq!(schema.version, "2.0");
        assert_eq!(schema.extra["owner"], "ops");
    }

    #[tokio::test]
    async fn test_stats_report_counts_and_location() {
        let store = Arc::new(MemoryBlobStore::new());
        let g = backend(&store);
        diamond(&g).await;
        g.create_node("Goal", "goal:1", Map::new()).await.unwrap();

        let stats = g.get_stats().await.unwrap();
        assert_eq!(stats.total_nodes, 6);
        assert_eq!(stats.total_edges, 5);
        assert_eq!(stats.nodes_by_type["Task"], 5);
        assert_eq!(stats.storage_backend, "blob_jsonl");
        assert_eq!(stats.details["prefix"], "graph/");
        assert_eq!(stats.details["store"], "memory");
    }
}
