//! Import of the pre-graph JSON documents: the topic taxonomy and the
//! consolidated task list.
//!
//! Node ids are derived from the source data, so a second run finds the
//! nodes of the first and skips them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use strata_core::blob::BlobStore;
use strata_core::error::{GraphError, Result};
use strata_core::service::GraphService;

use crate::taxonomy::{Taxonomy, TaxonomyTopic};

pub const TAXONOMY_OBJECT: &str = "topic_taxonomy.json";
pub const CONSOLIDATED_TASKS_OBJECT: &str = "tasks/consolidated_tasks.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSource {
    ConsolidatedTasks,
    TopicTaxonomy,
}

impl ImportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportSource::ConsolidatedTasks => "consolidated_tasks",
            ImportSource::TopicTaxonomy => "topic_taxonomy",
        }
    }

    pub fn default_object(&self) -> &'static str {
        match self {
            ImportSource::ConsolidatedTasks => CONSOLIDATED_TASKS_OBJECT,
            ImportSource::TopicTaxonomy => TAXONOMY_OBJECT,
        }
    }
}

impl fmt::Display for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportSource {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "consolidated_tasks" => Ok(ImportSource::ConsolidatedTasks),
            "topic_taxonomy" => Ok(ImportSource::TopicTaxonomy),
            _ => Err(GraphError::Validation(
                "source must be 'consolidated_tasks' or 'topic_taxonomy'".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportOptions {
    /// Object key to read instead of the source's default.
    #[serde(default)]
    pub object: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub source: String,
    pub object: String,
    pub imported_nodes: usize,
    pub imported_edges: usize,
    pub skipped: usize,
    pub nodes: Vec<String>,
}

/// `Work/Projects` -> `topic:work_projects`
pub fn topic_id(path: &str) -> String {
    format!("topic:{}", path.to_lowercase().replace('/', "_"))
}

/// `task:{first 8 chars of the transcript id}_{position}`
pub fn task_id(source_transcript_id: &str, position: usize) -> String {
    let short: String = source_transcript_id.chars().take(8).collect();
    format!("task:{}_{}", short, position)
}

/// One entry of `tasks/consolidated_tasks.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsolidatedTask {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub assignee: Option<Value>,
    #[serde(default)]
    pub deadline: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub source_transcript_id: Option<String>,
    #[serde(default)]
    pub source_transcript_title: Option<String>,
    #[serde(default)]
    pub primary_topic: Option<String>,
    #[serde(default)]
    pub secondary_topics: Vec<String>,
}

impl ConsolidatedTask {
    /// Node properties: status starts `pending`, priority defaults to
    /// `medium`, the primary topic to `General`. Absent optional fields
    /// stay absent.
    pub fn into_properties(self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("description".into(), json!(self.description));
        props.insert("status".into(), json!("pending"));
        props.insert(
            "priority".into(),
            json!(self.priority.unwrap_or_else(|| "medium".to_string())),
        );
        let optional = [
            ("assignee", self.assignee),
            ("deadline", self.deadline),
            ("context", self.context),
            ("source_transcript_id", self.source_transcript_id.map(Value::String)),
            ("source_transcript_title", self.source_transcript_title.map(Value::String)),
        ];
        for (key, value) in optional {
            if let Some(value) = value.filter(|v| !v.is_null()) {
                props.insert(key.into(), value);
            }
        }
        props.insert(
            "primary_topic".into(),
            json!(self
                .primary_topic
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "General".to_string())),
        );
        props.insert("secondary_topics".into(), json!(self.secondary_topics));
        props
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConsolidatedDoc {
    #[serde(default)]
    tasks: Vec<ConsolidatedTask>,
}

async fn read_object<T: serde::de::DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<T> {
    let blob = store.get(key).await?.ok_or_else(|| GraphError::NotFound {
        kind: "Object",
        id: key.to_string(),
    })?;
    serde_json::from_slice(&blob.data).map_err(|source| {
        tracing::error!(object = %key, error = %source, "Malformed import document");
        GraphError::Corrupt {
            path: key.to_string(),
            line: source.line(),
            source,
        }
    })
}

/// Create a `Topic` node per taxonomy entry, parents first, with a `parent`
/// edge to the parent topic when it exists.
pub async fn import_topic_taxonomy(graph: &GraphService, taxonomy: &Taxonomy) -> Result<ImportReport> {
    let mut topics: Vec<&TaxonomyTopic> = taxonomy.topics.iter().filter(|t| !t.path.is_empty()).collect();
    topics.sort_by_key(|t| t.depth());

    let mut report = ImportReport {
        source: ImportSource::TopicTaxonomy.to_string(),
        ..ImportReport::default()
    };
    for topic in topics {
        let id = topic_id(&topic.path);
        if graph.node_exists(&id).await? {
            report.skipped += 1;
            continue;
        }

        let props = json!({
            "name": topic.name(),
            "path": topic.path,
            "description": topic.description,
            "examples": topic.examples,
        });
        let data = props.as_object().cloned().unwrap_or_default();
        graph.create_node("Topic", data, Some(&id)).await?;
        report.imported_nodes += 1;
        report.nodes.push(id.clone());

        if let Some(parent) = topic.parent_path() {
            let parent_id = topic_id(parent);
            if graph.node_exists(&parent_id).await? {
                graph.create_edge(&id, "parent", &parent_id, None).await?;
                report.imported_edges += 1;
            }
        }
    }
    Ok(report)
}

/// Create a `Task` node per consolidated task with a `hasTopic` edge to its
/// primary topic when that topic exists.
pub async fn import_consolidated_tasks(graph: &GraphService, tasks: Vec<ConsolidatedTask>) -> Result<ImportReport> {
    let mut report = ImportReport {
        source: ImportSource::ConsolidatedTasks.to_string(),
        ..ImportReport::default()
    };
    for (position, task) in tasks.into_iter().enumerate() {
        let id = task_id(task.source_transcript_id.as_deref().unwrap_or_default(), position);
        if graph.node_exists(&id).await? {
            report.skipped += 1;
            continue;
        }

        let topic_path = task.primary_topic.clone().unwrap_or_default();
        graph.create_node("Task", task.into_properties(), Some(&id)).await?;
        report.imported_nodes += 1;
        report.nodes.push(id.clone());

        if !topic_path.is_empty() {
            let topic = topic_id(&topic_path);
            if graph.node_exists(&topic).await? {
                graph.create_edge(&id, "hasTopic", &topic, None).await?;
                report.imported_edges += 1;
            }
        }
    }
    Ok(report)
}

/// Read the source document from `store` and import it.
pub async fn run_import(
    graph: &GraphService,
    store: &dyn BlobStore,
    source: ImportSource,
    options: &ImportOptions,
) -> anyhow::Result<ImportReport> {
    let object = options
        .object
        .clone()
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| source.default_object().to_string());
    tracing::info!(event = "import_started", source = %source, object = %object, "Legacy import started");

    let mut report = match source {
        ImportSource::TopicTaxonomy => {
            let taxonomy: Taxonomy = read_object(store, &object).await?;
            import_topic_taxonomy(graph, &taxonomy).await?
        }
        ImportSource::ConsolidatedTasks => {
            let doc: ConsolidatedDoc = read_object(store, &object).await?;
            import_consolidated_tasks(graph, doc.tasks).await?
        }
    };
    report.object = object;

    tracing::info!(
        event = "import_completed",
        source = %source,
        imported_nodes = report.imported_nodes,
        imported_edges = report.imported_edges,
        skipped = report.skipped,
        "Legacy import finished"
    );
    Ok(report)
}
