//! strata-cli: command-line client for the Strata graph store
//!
//! Talks to a running `strata-server` over its HTTP API.
//!
//! # Subcommands
//! - `status`                                 server health
//! - `stats`                                  node and edge counts
//! - `get <id>`                               print one node
//! - `search <query> [-t type] [-n limit]`    property search
//! - `subgraph <id> [--depth] [--format]`     neighbourhood of a node
//! - `context <query> [--mode] [--format]`    query-driven retrieval for prompts
//! - `import <source> [--object key]`         legacy import
//! - `repair`                                 rebuild indexes, drop dangling edges

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8770";
const DEFAULT_LIMIT: usize = 20;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "strata-cli", version, about = "Strata graph store client")]
struct Cli {
    /// Strata HTTP server URL (overrides STRATA_HTTP_URL env var)
    #[arg(long, env = "STRATA_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server health
    Status,

    /// Show graph statistics
    Stats,

    /// Print a node as JSON
    Get {
        id: String,
    },

    /// Search node names and descriptions
    Search {
        query: String,

        /// Restrict to one node type
        #[arg(short = 't', long = "type")]
        node_type: Option<String>,

        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Extract the subgraph around a node
    Subgraph {
        id: String,

        #[arg(short, long, default_value_t = 2)]
        depth: usize,

        /// json, markdown or narrative
        #[arg(short, long, default_value = "markdown")]
        format: String,
    },

    /// Retrieve prompt context for a free-text query
    Context {
        query: String,

        /// auto, subgraph, path, entity or relation
        #[arg(short, long, default_value = "auto")]
        mode: String,

        /// json, markdown or narrative
        #[arg(short, long, default_value = "narrative")]
        format: String,

        #[arg(long, default_value_t = 50)]
        max_nodes: usize,

        #[arg(long)]
        max_tokens: Option<usize>,
    },

    /// Import legacy data (consolidated_tasks or topic_taxonomy)
    Import {
        source: String,

        /// Object key to read instead of the source's default
        #[arg(long)]
        object: Option<String>,
    },

    /// Rebuild indexes and drop dangling edges
    Repair,
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ContextQuery {
    pub query: String,
    pub mode: String,
    pub format: String,
    pub max_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ImportBody {
    pub source: String,
    pub options: ImportBodyOptions,
}

#[derive(Debug, Serialize)]
pub struct ImportBodyOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
}

// ============================================================================
// HTTP client
// ============================================================================

struct Api {
    base: String,
    client: reqwest::blocking::Client,
}

impl Api {
    fn new(server: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: server.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<reqwest::blocking::Response> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .with_context(|| format!("connection failed to {}", url))?;
        check(resp)
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> anyhow::Result<reqwest::blocking::Response> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .with_context(|| format!("connection failed to {}", url))?;
        check(resp)
    }
}

/// Turn a non-2xx response into an error carrying the server's message.
fn check(resp: reqwest::blocking::Response) -> anyhow::Result<reqwest::blocking::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    bail!("server returned {}: {}", status, error_message(&body))
}

/// The `error` field of an API error body, or the body itself.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

// ============================================================================
// Output formatting
// ============================================================================

/// `id  [Type]  name (status)`, falling back to the description for the label.
pub fn node_line(node: &Value) -> String {
    let id = node["@id"].as_str().unwrap_or("?");
    let node_type = node["@type"].as_str().unwrap_or("?");
    let label = node["name"]
        .as_str()
        .filter(|s| !s.is_empty())
        .or_else(|| node["description"].as_str())
        .unwrap_or("");
    let label: String = label.chars().take(80).collect();
    match node["status"].as_str() {
        Some(status) => format!("{}  [{}]  {} ({})", id, node_type, label, status),
        None => format!("{}  [{}]  {}", id, node_type, label),
    }
}

pub fn stats_lines(stats: &Value) -> Vec<String> {
    let mut lines = vec![
        format!("Backend:  {}", stats["storage_backend"].as_str().unwrap_or("?")),
        format!("Nodes:    {}", stats["total_nodes"]),
        format!("Edges:    {}", stats["total_edges"]),
    ];
    if let Some(by_type) = stats["nodes_by_type"].as_object() {
        for (node_type, count) in by_type {
            lines.push(format!("  {:<12} {}", node_type, count));
        }
    }
    lines
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn do_status(api: &Api) -> anyhow::Result<()> {
    let body: Value = api.get("/health", &[])?.json()?;
    println!("Strata server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
    println!("Backend:       {}", body["backend"].as_str().unwrap_or("?"));
    println!("Nodes:         {}", body["node_count"]);
    Ok(())
}

fn do_stats(api: &Api) -> anyhow::Result<()> {
    let stats: Value = api.get("/stats", &[])?.json()?;
    for line in stats_lines(&stats) {
        println!("{}", line);
    }
    Ok(())
}

fn do_get(api: &Api, id: &str) -> anyhow::Result<()> {
    let body: Value = api.get(&format!("/nodes/{}", id), &[])?.json()?;
    print_json(&body["node"])
}

fn do_search(api: &Api, query: &str, node_type: Option<String>, limit: usize, json: bool) -> anyhow::Result<()> {
    let mut params = vec![("q", query.to_string()), ("limit", limit.to_string())];
    if let Some(t) = node_type {
        params.push(("type", t));
    }
    let body: Value = api.get("/search", &params)?.json()?;
    if json {
        return print_json(&body);
    }

    let nodes = body["nodes"].as_array().cloned().unwrap_or_default();
    if nodes.is_empty() {
        eprintln!("No results found for: {}", query);
        return Ok(());
    }
    for node in &nodes {
        println!("{}", node_line(node));
    }
    Ok(())
}

fn do_subgraph(api: &Api, id: &str, depth: usize, format: &str) -> anyhow::Result<()> {
    let params = [("depth", depth.to_string()), ("format", format.to_string())];
    let text = api.get(&format!("/subgraph/{}", id), &params)?.text()?;
    println!("{}", text);
    Ok(())
}

fn do_context(api: &Api, body: &ContextQuery) -> anyhow::Result<()> {
    let text = api.post("/context/query", body)?.text()?;
    println!("{}", text);
    Ok(())
}

fn do_import(api: &Api, source: &str, object: Option<String>) -> anyhow::Result<()> {
    let body = ImportBody {
        source: source.to_string(),
        options: ImportBodyOptions { object },
    };
    let report: Value = api.post("/import", &body)?.json()?;
    println!(
        "Imported {} nodes and {} edges from {} ({} skipped)",
        report["imported_nodes"],
        report["imported_edges"],
        report["object"].as_str().unwrap_or(source),
        report["skipped"]
    );
    Ok(())
}

fn do_repair(api: &Api) -> anyhow::Result<()> {
    let report: Value = api.post("/admin/repair", &serde_json::json!({}))?.json()?;
    print_json(&report)
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Api::new(&cli.server).and_then(|api| match cli.command {
        Commands::Status => do_status(&api),
        Commands::Stats => do_stats(&api),
        Commands::Get { id } => do_get(&api, &id),
        Commands::Search { query, node_type, limit, json } => do_search(&api, &query, node_type, limit, json),
        Commands::Subgraph { id, depth, format } => do_subgraph(&api, &id, depth, &format),
        Commands::Context { query, mode, format, max_nodes, max_tokens } => do_context(
            &api,
            &ContextQuery {
                query,
                mode,
                format,
                max_nodes,
                max_tokens,
            },
        ),
        Commands::Import { source, object } => do_import(&api, &source, object),
        Commands::Repair => do_repair(&api),
    });

    if let Err(e) = result {
        eprintln!("strata-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
