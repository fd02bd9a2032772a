//! Graph backend over Neo4j (Bolt protocol via `neo4rs`).
//!
//! Every node carries the shared `GraphNode` label plus its type label, and
//! an `id` property backed by a uniqueness constraint. Relationship types
//! are the relation uppercased; the exact relation string is kept in a
//! `relation` property.

mod bolt;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use neo4rs::{query, BoltType, ConfigBuilder, Graph, Query, Row};
use serde_json::{json, Map, Value};

use super::{validate_node_id, validate_node_type, GraphBackend};
use crate::clock::Clock;
use crate::config::Neo4jConfig;
use crate::error::{GraphError, Result};
use crate::models::node::NODE_RESERVED_KEYS;
use crate::models::{
    Direction, Edge, EdgeSpec, GraphStats, Node, NodeQuery, NodeSpec, Schema,
};

use bolt::{
    edge_from_row, edge_props, encode_value, field, needs_json, node_from_row, node_props, quote,
    relationship_type, stored_key, EDGE_COLUMNS, JSON_KEYS, NODE_COLUMNS, NODE_LABEL,
};

pub const STORAGE_BACKEND: &str = "neo4j";

/// Schema statements run by `initialize`; failures are logged, not fatal.
const SCHEMA_STATEMENTS: [&str; 4] = [
    "CREATE CONSTRAINT graph_node_id IF NOT EXISTS FOR (n:GraphNode) REQUIRE n.id IS UNIQUE",
    "CREATE INDEX graph_node_created_at IF NOT EXISTS FOR (n:GraphNode) ON (n.created_at)",
    "CREATE INDEX task_status IF NOT EXISTS FOR (n:Task) ON (n.status)",
    "CREATE INDEX task_priority IF NOT EXISTS FOR (n:Task) ON (n.priority)",
];

pub struct Neo4jBackend {
    graph: Graph,
    uri: String,
    database: String,
    clock: Clock,
}

fn pattern_for(direction: Direction) -> &'static str {
    match direction {
        Direction::Outgoing => "(n:GraphNode {id: $id})-[r]->(m:GraphNode)",
        Direction::Incoming => "(n:GraphNode {id: $id})<-[r]-(m:GraphNode)",
        Direction::Both => "(n:GraphNode {id: $id})-[r]-(m:GraphNode)",
    }
}

/// User data minus the keys the store owns.
fn writable(data: Map<String, Value>) -> Map<String, Value> {
    let mut data = data;
    for key in NODE_RESERVED_KEYS {
        data.remove(key);
    }
    data
}

/// `WHERE` clause and parameters for a node query. Values stored as JSON
/// text only match where the key is recorded as JSON, and plain strings
/// only where it is not.
fn compile_filters(filters: &Map<String, Value>) -> (String, Vec<(String, BoltType)>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for (i, (key, value)) in filters.iter().enumerate() {
        let param = format!("f{}", i);
        let clause = match key.as_str() {
            "@type" => format!("${} IN labels(n)", param),
            "@id" => format!("n.id = ${}", param),
            "created_at" | "updated_at" => format!("n.{} = ${}", key, param),
            other => {
                let stored = stored_key(other);
                let key_param = format!("{}k", param);
                let membership = format!("${} IN coalesce(n.{}, [])", key_param, JSON_KEYS);
                let clause = if needs_json(value) {
                    format!("n.{} = ${} AND {}", quote(&stored), param, membership)
                } else if value.is_string() {
                    format!("n.{} = ${} AND NOT {}", quote(&stored), param, membership)
                } else {
                    format!("n.{} = ${}", quote(&stored), param)
                };
                params.push((key_param, BoltType::from(stored)));
                clause
            }
        };
        clauses.push(clause);
        params.push((param, encode_value(value)));
    }
    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

fn match_clause(node_type: Option<&str>) -> Result<String> {
    match node_type {
        Some(t) => {
            validate_node_type(t)?;
            Ok(format!("MATCH (n:{}:{})", NODE_LABEL, quote(t)))
        }
        None => Ok(format!("MATCH (n:{})", NODE_LABEL)),
    }
}

impl Neo4jBackend {
    pub async fn connect(config: &Neo4jConfig, clock: Clock) -> Result<Self> {
        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.username)
            .password(config.resolved_password())
            .db(config.database.as_str())
            .max_connections(config.max_connections)
            .build()?;
        let graph = Graph::connect(neo_config).await.map_err(|e| {
            tracing::error!(uri = %config.uri, error = %e, "Failed to connect to Neo4j");
            GraphError::Database(e)
        })?;
        tracing::info!(uri = %config.uri, database = %config.database, "Connected to Neo4j");
        Ok(Self {
            graph,
            uri: config.uri.clone(),
            database: config.database.clone(),
            clock,
        })
    }

    fn db_error(&self, op: &'static str, e: neo4rs::Error) -> GraphError {
        tracing::error!(op = op, uri = %self.uri, error = %e, "Neo4j query failed");
        GraphError::Database(e)
    }

    async fn fetch(&self, op: &'static str, q: Query) -> Result<Vec<Row>> {
        let mut stream = self.graph.execute(q).await.map_err(|e| self.db_error(op, e))?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(|e| self.db_error(op, e))? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn run(&self, op: &'static str, q: Query) -> Result<()> {
        self.graph.run(q).await.map_err(|e| self.db_error(op, e))
    }

    async fn count(&self, op: &'static str, q: Query) -> Result<usize> {
        let rows = self.fetch(op, q).await?;
        let n: i64 = match rows.first() {
            Some(row) => field(row, "c")?,
            None => 0,
        };
        Ok(n.max(0) as usize)
    }

    /// Ids among `ids` that exist.
    async fn existing_ids(&self, ids: Vec<String>) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let q = query("MATCH (n:GraphNode) WHERE n.id IN $ids RETURN n.id AS id").param("ids", ids);
        self.fetch("existing_ids", q)
            .await?
            .iter()
            .map(|row| field::<String>(row, "id"))
            .collect()
    }

    async fn single_node(&self, op: &'static str, q: Query) -> Result<Option<Node>> {
        match self.fetch(op, q).await?.first() {
            Some(row) => Ok(Some(node_from_row(row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl GraphBackend for Neo4jBackend {
    fn name(&self) -> &str {
        STORAGE_BACKEND
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }

    async fn create_node(&self, node_type: &str, node_id: &str, data: Map<String, Value>) -> Result<Node> {
        validate_node_type(node_type)?;
        validate_node_id(node_id)?;
        // The uniqueness constraint backs this up under races.
        if self.node_exists(node_id).await? {
            return Err(GraphError::AlreadyExists(node_id.to_string()));
        }

        let node = Node::new(node_type, node_id, &self.clock.now(), writable(data));
        let cypher = format!("CREATE (n:{}:{}) SET n = $props", NODE_LABEL, quote(node_type));
        self.run("create_node", query(&cypher).param("props", node_props(&node)))
            .await?;
        tracing::debug!(event = "node_created", node_id = node_id, node_type = node_type, "Node created");
        Ok(node)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let cypher = format!("MATCH (n:GraphNode {{id: $id}}) RETURN {} LIMIT 1", NODE_COLUMNS);
        self.single_node("get_node", query(&cypher).param("id", node_id))
            .await
    }

    async fn get_nodes(&self, node_ids: &[String]) -> Result<HashMap<String, Node>> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let cypher = format!("MATCH (n:GraphNode) WHERE n.id IN $ids RETURN {}", NODE_COLUMNS);
        let rows = self
            .fetch("get_nodes", query(&cypher).param("ids", node_ids.to_vec()))
            .await?;
        rows.iter()
            .map(|row| node_from_row(row).map(|n| (n.id.clone(), n)))
            .collect()
    }

    async fn update_node(&self, node_id: &str, data: Map<String, Value>, merge: bool) -> Result<Node> {
        let now = self.clock.now();
        let q = if merge {
            // Keys written now leave the JSON list unless they are JSON again.
            let (props, json_keys) = bolt::encode_user_props(&writable(data));
            let updated: Vec<String> = props.keys().cloned().collect();
            let cypher = format!(
                "MATCH (n:GraphNode {{id: $id}}) \
                 SET n.{json} = [k IN coalesce(n.{json}, []) WHERE NOT k IN $updated] + $json_keys \
                 SET n += $props, n.updated_at = $now \
                 RETURN {cols}",
                json = JSON_KEYS,
                cols = NODE_COLUMNS
            );
            query(&cypher)
                .param("id", node_id)
                .param("updated", updated)
                .param("json_keys", json_keys)
                .param("props", props)
                .param("now", now)
        } else {
            // Replacement keeps the fixed fields.
            let cypher = format!(
                "MATCH (n:GraphNode {{id: $id}}) \
                 WITH n, n.created_at AS created_at \
                 SET n = $props, n.id = $id, n.created_at = created_at, n.updated_at = $now \
                 RETURN {}",
                NODE_COLUMNS
            );
            query(&cypher)
                .param("id", node_id)
                .param("props", bolt::encode_props(&writable(data)))
                .param("now", now)
        };

        match self.single_node("update_node", q).await? {
            Some(node) => {
                tracing::debug!(event = "node_updated", node_id = node_id, merge = merge, "Node updated");
                Ok(node)
            }
            None => Err(GraphError::node_not_found(node_id)),
        }
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool> {
        let q = query("MATCH (n:GraphNode {id: $id}) DETACH DELETE n RETURN count(*) AS c").param("id", node_id);
        let deleted = self.count("delete_node", q).await? > 0;
        if deleted {
            tracing::debug!(event = "node_deleted", node_id = node_id, "Node deleted");
        }
        Ok(deleted)
    }

    async fn node_exists(&self, node_id: &str) -> Result<bool> {
        let q = query("MATCH (n:GraphNode {id: $id}) RETURN count(n) AS c").param("id", node_id);
        Ok(self.count("node_exists", q).await? > 0)
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
        let found = self
            .existing_ids(vec![from_id.to_string(), to_id.to_string()])
            .await?;
        for id in [from_id, to_id] {
            if !found.contains(id) {
                return Err(GraphError::node_not_found(id));
            }
        }

        let edge = Edge::new(from_id, relation, to_id, &self.clock.now(), data);
        let cypher = format!(
            "MATCH (a:GraphNode {{id: $from}}), (b:GraphNode {{id: $to}}) \
             CREATE (a)-[r:{}]->(b) SET r = $props",
            quote(&relationship_type(relation))
        );
        let q = query(&cypher)
            .param("from", from_id)
            .param("to", to_id)
            .param("props", edge_props(&edge));
        self.run("create_edge", q).await?;
        tracing::debug!(event = "edge_created", edge_id = %edge.id, relation = relation, "Edge created");
        Ok(edge)
    }

    async fn get_edges(&self, node_id: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<Edge>> {
        let filter = if relation.is_some() {
            " WHERE coalesce(r.relation, toLower(type(r))) = $relation"
        } else {
            ""
        };
        let cypher = format!(
            "MATCH {}{} RETURN DISTINCT {} ORDER BY r.created_at",
            pattern_for(direction),
            filter,
            EDGE_COLUMNS
        );
        let mut q = query(&cypher).param("id", node_id);
        if let Some(relation) = relation {
            q = q.param("relation", relation);
        }
        self.fetch("get_edges", q)
            .await?
            .iter()
            .map(edge_from_row)
            .collect()
    }

    async fn edges_for_nodes(
        &self,
        node_ids: &[String],
        direction: Direction,
    ) -> Result<HashMap<String, Vec<Edge>>> {
        let mut out: HashMap<String, Vec<Edge>> =
            node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        if node_ids.is_empty() {
            return Ok(out);
        }
        let pattern = pattern_for(direction).replace("{id: $id}", "{id: nid}");
        let cypher = format!(
            "UNWIND $ids AS nid MATCH {} RETURN DISTINCT nid, {} ORDER BY r.created_at",
            pattern, EDGE_COLUMNS
        );
        let rows = self
            .fetch("edges_for_nodes", query(&cypher).param("ids", node_ids.to_vec()))
            .await?;
        for row in &rows {
            let nid: String = field(row, "nid")?;
            out.entry(nid).or_default().push(edge_from_row(row)?);
        }
        Ok(out)
    }

    async fn delete_edge(&self, edge_id: &str) -> Result<bool> {
        let q = query("MATCH ()-[r {id: $id}]->() DELETE r RETURN count(*) AS c").param("id", edge_id);
        Ok(self.count("delete_edge", q).await? > 0)
    }

    async fn delete_edges_for_node(&self, node_id: &str) -> Result<usize> {
        let q = query(
            "MATCH (n:GraphNode {id: $id})-[r]-() WITH DISTINCT r DELETE r RETURN count(*) AS c",
        )
        .param("id", node_id);
        self.count("delete_edges_for_node", q).await
    }

    async fn edges_by_relation(&self, relation_types: &[String], max_edges: usize) -> Result<Vec<Edge>> {
        if relation_types.is_empty() || max_edges == 0 {
            return Ok(Vec::new());
        }
        let cypher = format!(
            "MATCH (a:GraphNode)-[r]->(b:GraphNode) \
             WHERE coalesce(r.relation, toLower(type(r))) IN $relations \
             RETURN {} LIMIT $limit",
            EDGE_COLUMNS
        );
        let q = query(&cypher)
            .param("relations", relation_types.to_vec())
            .param("limit", max_edges as i64);
        self.fetch("edges_by_relation", q)
            .await?
            .iter()
            .map(edge_from_row)
            .collect()
    }

    async fn query_nodes(&self, query_spec: &NodeQuery) -> Result<Vec<Node>> {
        let (where_clause, params) = compile_filters(&query_spec.filters);
        let cypher = format!(
            "{}{} RETURN {} ORDER BY n.created_at DESC SKIP $skip LIMIT $limit",
            match_clause(query_spec.node_type.as_deref())?,
            where_clause,
            NODE_COLUMNS
        );
        let mut q = query(&cypher)
            .param("skip", query_spec.offset as i64)
            .param("limit", query_spec.limit as i64);
        for (name, value) in params {
            q = q.param(&name, value);
        }
        self.fetch("query_nodes", q)
            .await?
            .iter()
            .map(node_from_row)
            .collect()
    }

    async fn count_nodes(&self, node_type: Option<&str>, filters: Option<&Map<String, Value>>) -> Result<usize> {
        let empty = Map::new();
        let (where_clause, params) = compile_filters(filters.unwrap_or(&empty));
        let cypher = format!(
            "{}{} RETURN count(n) AS c",
            match_clause(node_type)?,
            where_clause
        );
        let mut q = query(&cypher);
        for (name, value) in params {
            q = q.param(&name, value);
        }
        self.count("count_nodes", q).await
    }

    async fn bulk_create_nodes(&self, specs: Vec<NodeSpec>) -> Result<Vec<Node>> {
        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut valid = Vec::new();
        for spec in specs {
            match &spec.id {
                Some(id)
                    if validate_node_id(id).is_ok()
                        && validate_node_type(&spec.node_type).is_ok()
                        && seen.insert(id.clone()) =>
                {
                    valid.push(spec)
                }
                _ => continue,
            }
        }

        let existing = self
            .existing_ids(valid.iter().filter_map(|s| s.id.clone()).collect())
            .await?;

        let mut by_type: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for spec in valid {
            let id = spec.id.unwrap_or_default();
            if existing.contains(&id) {
                continue;
            }
            let node = Node::new(&spec.node_type, &id, &now, writable(spec.data));
            by_type.entry(spec.node_type).or_default().push(node);
        }

        let mut created = Vec::new();
        for (node_type, nodes) in by_type {
            let rows: Vec<BoltType> = nodes.iter().map(|n| BoltType::from(node_props(n))).collect();
            let cypher = format!(
                "UNWIND $rows AS row CREATE (n:{}:{}) SET n = row",
                NODE_LABEL,
                quote(&node_type)
            );
            self.run("bulk_create_nodes", query(&cypher).param("rows", rows))
                .await?;
            created.extend(nodes);
        }

        tracing::info!(event = "bulk_nodes_created", created = created.len(), "Bulk node import finished");
        Ok(created)
    }

    async fn bulk_create_edges(&self, specs: Vec<EdgeSpec>) -> Result<Vec<Edge>> {
        let complete: Vec<EdgeSpec> = specs.into_iter().filter(|s| s.is_complete()).collect();
        let endpoints: BTreeSet<String> = complete
            .iter()
            .flat_map(|s| [s.from_id.clone(), s.to_id.clone()])
            .collect();
        let existing = self.existing_ids(endpoints.into_iter().collect()).await?;

        let now = self.clock.now();
        let mut by_type: BTreeMap<String, Vec<Edge>> = BTreeMap::new();
        for spec in complete {
            if !existing.contains(&spec.from_id) || !existing.contains(&spec.to_id) {
                continue;
            }
            let edge = Edge::new(&spec.from_id, &spec.relation, &spec.to_id, &now, spec.data);
            by_type
                .entry(relationship_type(&spec.relation))
                .or_default()
                .push(edge);
        }

        let mut created = Vec::new();
        for (rel_type, edges) in by_type {
            let rows: Vec<BoltType> = edges
                .iter()
                .map(|e| {
                    let mut row: HashMap<String, BoltType> = HashMap::new();
                    row.insert("from_id".into(), BoltType::from(e.from_id.clone()));
                    row.insert("to_id".into(), BoltType::from(e.to_id.clone()));
                    row.insert("props".into(), BoltType::from(edge_props(e)));
                    BoltType::from(row)
                })
                .collect();
            let cypher = format!(
                "UNWIND $rows AS row \
                 MATCH (a:GraphNode {{id: row.from_id}}), (b:GraphNode {{id: row.to_id}}) \
                 CREATE (a)-[r:{}]->(b) SET r = row.props",
                quote(&rel_type)
            );
            self.run("bulk_create_edges", query(&cypher).param("rows", rows))
                .await?;
            created.extend(edges);
        }

        tracing::info!(event = "bulk_edges_created", created = created.len(), "Bulk edge import finished");
        Ok(created)
    }

    async fn get_schema(&self) -> Result<Schema> {
        let mut schema = Schema::default();

        let rows = self
            .fetch("schema_labels", query("CALL db.labels() YIELD label RETURN label"))
            .await?;
        for row in &rows {
            let label: String = field(row, "label")?;
            if label != NODE_LABEL && !schema.node_types.contains(&label) {
                schema.node_types.push(label);
            }
        }

        let rows = self
            .fetch(
                "schema_relations",
                query(
                    "MATCH (:GraphNode)-[r]->(:GraphNode) \
                     RETURN DISTINCT coalesce(r.relation, toLower(type(r))) AS relation",
                ),
            )
            .await?;
        for row in &rows {
            let relation: String = field(row, "relation")?;
            if !schema.relation_types.contains(&relation) {
                schema.relation_types.push(relation);
            }
        }
        Ok(schema)
    }

    async fn get_stats(&self) -> Result<GraphStats> {
        let rows = self
            .fetch(
                "stats_labels",
                query(
                    "MATCH (n:GraphNode) UNWIND labels(n) AS label \
                     WITH label WHERE label <> 'GraphNode' \
                     RETURN label, count(*) AS c",
                ),
            )
            .await?;
        let mut nodes_by_type = BTreeMap::new();
        for row in &rows {
            let label: String = field(row, "label")?;
            let count: i64 = field(row, "c")?;
            nodes_by_type.insert(label, count.max(0) as usize);
        }

        let total_nodes = self
            .count("stats_nodes", query("MATCH (n:GraphNode) RETURN count(n) AS c"))
            .await?;
        let total_edges = self
            .count(
                "stats_edges",
                query("MATCH (:GraphNode)-[r]->(:GraphNode) RETURN count(r) AS c"),
            )
            .await?;

        let mut details = Map::new();
        details.insert("uri".into(), json!(self.uri));
        details.insert("database".into(), json!(self.database));

        Ok(GraphStats {
            total_nodes,
            total_edges,
            nodes_by_type,
            storage_backend: STORAGE_BACKEND.to_string(),
            details,
        })
    }

    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            if let Err(e) = self.graph.run(query(statement)).await {
                tracing::warn!(statement = statement, error = %e, "Schema statement failed");
            }
        }
        tracing::info!(uri = %self.uri, "Neo4j schema ensured");
        Ok(())
    }
}
