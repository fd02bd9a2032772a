//! Rendering retrieval contexts as prompt text.
//!
//! Every format is cut to roughly `max_tokens` tokens, counted as four
//! characters per token.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{GraphError, Result};
use crate::models::{GraphContext, Node, PathStep};

pub const DEFAULT_MAX_TOKENS: usize = 4000;

const CHARS_PER_TOKEN: usize = 4;
const TRUNCATION_MARKER: &str = "\n... (truncated)";
const MARKDOWN_EDGE_LIMIT: usize = 20;
const NARRATIVE_NODE_LIMIT: usize = 10;
const NARRATIVE_EDGE_LIMIT: usize = 10;
const NARRATIVE_PATH_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFormat {
    #[default]
    Json,
    Markdown,
    Narrative,
}

impl ContextFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextFormat::Json => "json",
            ContextFormat::Markdown => "markdown",
            ContextFormat::Narrative => "narrative",
        }
    }

    /// Markdown and narrative are prose; JSON is a document.
    pub fn is_text(&self) -> bool {
        !matches!(self, ContextFormat::Json)
    }
}

impl fmt::Display for ContextFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextFormat {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "" => Ok(ContextFormat::Json),
            "markdown" | "md" => Ok(ContextFormat::Markdown),
            "narrative" | "text" => Ok(ContextFormat::Narrative),
            other => Err(GraphError::Validation(format!(
                "format must be json, markdown or narrative (got {})",
                other
            ))),
        }
    }
}

/// Render `context` for a prompt.
pub fn format_for_llm(context: &GraphContext, format: ContextFormat, max_tokens: usize) -> Result<String> {
    let rendered = match format {
        ContextFormat::Json => format_json(context)?,
        ContextFormat::Markdown => format_markdown(context),
        ContextFormat::Narrative => format_narrative(context),
    };
    Ok(truncate(rendered, max_tokens.saturating_mul(CHARS_PER_TOKEN)))
}

/// Context and nodes as-is, edges reduced to `{from, relation, to}`, no
/// `_meta` or `_paths`.
fn format_json(context: &GraphContext) -> Result<String> {
    let relationships: Vec<Value> = context
        .edges
        .iter()
        .map(|e| json!({"from": e.from_id, "relation": e.relation, "to": e.to_id}))
        .collect();
    let output = json!({
        "@context": context.context,
        "@graph": context.graph,
        "relationships": relationships,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

fn format_markdown(context: &GraphContext) -> String {
    let mut lines = vec!["# Knowledge Graph Context\n".to_string()];

    let mut type_order: Vec<&str> = Vec::new();
    let mut by_type: HashMap<&str, Vec<&Node>> = HashMap::new();
    for node in &context.graph {
        let group = by_type.entry(node.node_type.as_str()).or_default();
        if group.is_empty() {
            type_order.push(node.node_type.as_str());
        }
        group.push(node);
    }

    for node_type in type_order {
        lines.push(format!("\n## {}s\n", node_type));
        for node in by_type.get(node_type).into_iter().flatten() {
            let name = non_empty(node, "name")
                .map(str::to_string)
                .or_else(|| non_empty(node, "description").map(|d| prefix_chars(d, 50)))
                .unwrap_or_else(|| node.id.clone());
            lines.push(format!("- **{}**", name));
            if let (Some(desc), Some(_)) = (non_empty(node, "description"), non_empty(node, "name")) {
                lines.push(format!("  - {}", prefix_chars(desc, 100)));
            }
            if let Some(status) = node.get("status").filter(|v| truthy(v)) {
                lines.push(format!("  - Status: {}", display_value(status)));
            }
        }
    }

    if !context.edges.is_empty() {
        lines.push("\n## Relationships\n".to_string());
        for edge in context.edges.iter().take(MARKDOWN_EDGE_LIMIT) {
            lines.push(format!("- {} --[{}]--> {}", edge.from_id, edge.relation, edge.to_id));
        }
    }

    lines.join("\n")
}

fn format_narrative(context: &GraphContext) -> String {
    if context.graph.is_empty() {
        return "No relevant context found.".to_string();
    }

    let mut lines = vec!["Here is relevant context from the knowledge graph:\n".to_string()];
    for node in context.graph.iter().take(NARRATIVE_NODE_LIMIT) {
        let name = non_empty(node, "name").unwrap_or(&node.id);
        match non_empty(node, "description") {
            Some(desc) => lines.push(format!("- {} is a {}. {}", name, node.node_type, desc)),
            None => lines.push(format!("- {} is a {}.", name, node.node_type)),
        }
    }

    if !context.edges.is_empty() {
        let names: HashMap<&str, &str> = context
            .graph
            .iter()
            .map(|n| (n.id.as_str(), non_empty(n, "name").unwrap_or(&n.id)))
            .collect();
        lines.push("\nKey relationships:".to_string());
        for edge in context.edges.iter().take(NARRATIVE_EDGE_LIMIT) {
            let from = names.get(edge.from_id.as_str()).copied().unwrap_or(&edge.from_id);
            let to = names.get(edge.to_id.as_str()).copied().unwrap_or(&edge.to_id);
            lines.push(format!("- {} {} {}", from, edge.relation.replace('_', " "), to));
        }
    }

    if let Some(paths) = context.paths.as_ref().filter(|p| !p.is_empty()) {
        lines.push("\nReasoning paths:".to_string());
        for path in paths.iter().take(NARRATIVE_PATH_LIMIT) {
            for step in &path.steps {
                match step {
                    PathStep::Node { node } => lines.push(format!("  → {}", node)),
                    PathStep::Edge { relation, .. } => lines.push(format!("    [{}]", relation)),
                }
            }
        }
    }

    lines.join("\n")
}

fn truncate(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn non_empty<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.str_prop(key).filter(|s| !s.is_empty())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
