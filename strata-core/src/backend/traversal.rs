//! Retrieval algorithms shared by every backend.
//!
//! These run against the [`GraphBackend`] primitives only, so the blob-file
//! and graph-database backends return identical shapes for identical data.

use std::collections::{HashMap, HashSet};

use serde_json::json;

use super::GraphBackend;
use crate::error::Result;
use crate::models::{
    Direction, Edge, GraphAccumulator, GraphContext, GraphPath, Node, PathItem, Traversal,
};

fn relation_allowed(relations: Option<&[String]>, edge: &Edge) -> bool {
    relations.map_or(true, |allowed| allowed.iter().any(|r| r == &edge.relation))
}

/// Breadth-first expansion with global node and edge visited sets.
///
/// Level 0 is the start node. Edges are only expanded from levels below
/// `depth`, so `depth = 0` yields the start node alone. Ids that do not
/// resolve to a node are skipped and not expanded.
pub async fn breadth_first<B: GraphBackend + ?Sized>(
    backend: &B,
    start_id: &str,
    depth: usize,
    relations: Option<&[String]>,
    direction: Direction,
) -> Result<Traversal> {
    let mut visited_nodes: HashSet<String> = HashSet::new();
    let mut visited_edges: HashSet<String> = HashSet::new();
    let mut nodes: Vec<Node> = Vec::new();
    let mut edges: Vec<Edge> = Vec::new();
    let mut frontier = vec![start_id.to_string()];

    for level in 0..=depth {
        let current: Vec<String> = frontier
            .drain(..)
            .filter(|id| visited_nodes.insert(id.clone()))
            .collect();
        if current.is_empty() {
            break;
        }

        let mut found = backend.get_nodes(&current).await?;
        let mut present = Vec::with_capacity(current.len());
        for id in current {
            if let Some(node) = found.remove(&id) {
                nodes.push(node);
                present.push(id);
            }
        }

        if level == depth || present.is_empty() {
            break;
        }

        let incident = backend.edges_for_nodes(&present, direction).await?;
        let mut next = Vec::new();
        for id in &present {
            for edge in incident.get(id).into_iter().flatten() {
                if !relation_allowed(relations, edge) || !visited_edges.insert(edge.id.clone()) {
                    continue;
                }
                let other = edge.other_end(id);
                if !visited_nodes.contains(other) {
                    next.push(other.to_string());
                }
                edges.push(edge.clone());
            }
        }
        frontier = next;
    }

    Ok(Traversal {
        start_node: start_id.to_string(),
        depth,
        node_count: nodes.len(),
        edge_count: edges.len(),
        nodes,
        edges,
    })
}

/// Traversal in both directions reshaped as a JSON-LD context, optionally
/// restricted to some node types.
pub async fn subgraph<B: GraphBackend + ?Sized>(
    backend: &B,
    node_id: &str,
    depth: usize,
    include_types: Option<&[String]>,
) -> Result<GraphContext> {
    let traversal = backend.traverse(node_id, depth, None, Direction::Both).await?;
    let schema = backend.get_schema().await?;

    let mut ctx = GraphContext {
        context: schema.context,
        graph: traversal.nodes,
        edges: traversal.edges,
        ..GraphContext::default()
    };
    if let Some(types) = include_types {
        ctx.graph.retain(|n| types.iter().any(|t| t == &n.node_type));
        ctx.prune_edges();
    }

    ctx.set_meta("focal_node", node_id);
    ctx.set_meta("depth", depth);
    ctx.set_meta("node_count", ctx.graph.len());
    ctx.set_meta("edge_count", ctx.edges.len());
    ctx.set_meta("extracted_at", backend.clock().now());
    Ok(ctx)
}

struct Branch {
    at: String,
    items: Vec<PathItem>,
    visited: HashSet<String>,
    hops: usize,
}

/// Every simple path `from_id -> to_id` of at most `max_depth` outgoing
/// edges, depth-first.
///
/// Each branch owns its visited set, so a node blocked on one branch stays
/// reachable on its siblings.
pub async fn simple_paths<B: GraphBackend + ?Sized>(
    backend: &B,
    from_id: &str,
    to_id: &str,
    max_depth: usize,
    relations: Option<&[String]>,
) -> Result<Vec<GraphPath>> {
    let start = match backend.get_node(from_id).await? {
        Some(node) => node,
        None => return Ok(Vec::new()),
    };

    let mut node_cache: HashMap<String, Option<Node>> = HashMap::new();
    let mut edge_cache: HashMap<String, Vec<Edge>> = HashMap::new();
    let mut paths = Vec::new();

    let mut stack = vec![Branch {
        at: from_id.to_string(),
        items: vec![PathItem::Node(start)],
        visited: HashSet::from([from_id.to_string()]),
        hops: 0,
    }];

    while let Some(branch) = stack.pop() {
        if branch.at == to_id {
            paths.push(GraphPath { items: branch.items });
            continue;
        }
        if branch.hops >= max_depth {
            continue;
        }

        if !edge_cache.contains_key(&branch.at) {
            let out = backend.get_edges(&branch.at, Direction::Outgoing, None).await?;
            edge_cache.insert(branch.at.clone(), out);
        }
        let outgoing: Vec<Edge> = edge_cache
            .get(&branch.at)
            .into_iter()
            .flatten()
            .filter(|e| relation_allowed(relations, e))
            .cloned()
            .collect();

        // Reversed so the first edge is explored first.
        for edge in outgoing.into_iter().rev() {
            if branch.visited.contains(&edge.to_id) {
                continue;
            }
            if !node_cache.contains_key(&edge.to_id) {
                let node = backend.get_node(&edge.to_id).await?;
                node_cache.insert(edge.to_id.clone(), node);
            }
            let next = match node_cache.get(&edge.to_id) {
                Some(Some(node)) => node.clone(),
                _ => continue,
            };

            let mut visited = branch.visited.clone();
            visited.insert(edge.to_id.clone());
            let mut items = branch.items.clone();
            let at = edge.to_id.clone();
            items.push(PathItem::Edge(edge));
            items.push(PathItem::Node(next));
            stack.push(Branch {
                at,
                items,
                visited,
                hops: branch.hops + 1,
            });
        }
    }

    Ok(paths)
}

/// Pairwise paths across `node_ids`, merged into one context with `_paths`.
pub async fn path_context<B: GraphBackend + ?Sized>(
    backend: &B,
    node_ids: &[String],
    max_depth: usize,
    relations: Option<&[String]>,
) -> Result<GraphContext> {
    let mut acc = GraphAccumulator::new();
    let mut summaries = Vec::new();

    for (i, from_id) in node_ids.iter().enumerate() {
        for to_id in &node_ids[i + 1..] {
            for path in backend.find_paths(from_id, to_id, max_depth, relations).await? {
                summaries.push(path.summary(from_id, to_id));
                for item in path.items {
                    match item {
                        PathItem::Node(n) => acc.add_node(n),
                        PathItem::Edge(e) => acc.add_edge(e),
                    }
                }
            }
        }
    }

    let schema = backend.get_schema().await?;
    let (graph, edges) = acc.into_parts();
    let mut ctx = GraphContext {
        context: schema.context,
        graph,
        edges,
        paths: None,
        ..GraphContext::default()
    };
    ctx.set_meta("query_nodes", json!(node_ids));
    ctx.set_meta("path_count", summaries.len());
    ctx.set_meta("node_count", ctx.graph.len());
    ctx.set_meta("edge_count", ctx.edges.len());
    ctx.set_meta("extracted_at", backend.clock().now());
    ctx.paths = Some(summaries);
    Ok(ctx)
}

/// Union of the k-hop neighbourhoods of `entity_ids`.
pub async fn entity_context<B: GraphBackend + ?Sized>(
    backend: &B,
    entity_ids: &[String],
    include_relations: bool,
    depth: usize,
) -> Result<GraphContext> {
    let mut acc = GraphAccumulator::new();
    for id in entity_ids {
        let traversal = backend.traverse(id, depth, None, Direction::Both).await?;
        traversal.nodes.into_iter().for_each(|n| acc.add_node(n));
        if include_relations {
            traversal.edges.into_iter().for_each(|e| acc.add_edge(e));
        }
    }

    let schema = backend.get_schema().await?;
    let (graph, edges) = acc.into_parts();
    let mut ctx = GraphContext {
        context: schema.context,
        graph,
        edges,
        ..GraphContext::default()
    };
    ctx.set_meta("query_entities", json!(entity_ids));
    ctx.set_meta("retrieval_type", "entity");
    ctx.set_meta("depth", depth);
    ctx.set_meta("node_count", ctx.graph.len());
    ctx.set_meta("extracted_at", backend.clock().now());
    Ok(ctx)
}

/// Global scan for edges of the given relations, up to
/// `limit * relation_types.len()` edges, plus their endpoints.
pub async fn relation_context<B: GraphBackend + ?Sized>(
    backend: &B,
    relation_types: &[String],
    limit: usize,
) -> Result<GraphContext> {
    let max_edges = limit.saturating_mul(relation_types.len());
    let edges = if max_edges == 0 {
        Vec::new()
    } else {
        backend.edges_by_relation(relation_types, max_edges).await?
    };

    let mut endpoint_ids: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for edge in &edges {
        for id in [edge.from_id.as_str(), edge.to_id.as_str()] {
            if seen.insert(id) {
                endpoint_ids.push(id.to_string());
            }
        }
    }

    let mut found = backend.get_nodes(&endpoint_ids).await?;
    let graph: Vec<Node> = endpoint_ids.iter().filter_map(|id| found.remove(id)).collect();

    let schema = backend.get_schema().await?;
    let mut ctx = GraphContext {
        context: schema.context,
        graph,
        edges,
        ..GraphContext::default()
    };
    ctx.set_meta("query_relations", json!(relation_types));
    ctx.set_meta("retrieval_type", "relation");
    ctx.set_meta("node_count", ctx.graph.len());
    ctx.set_meta("edge_count", ctx.edges.len());
    ctx.set_meta("extracted_at", backend.clock().now());
    Ok(ctx)
}
