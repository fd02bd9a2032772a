//! Topic taxonomy: the hierarchy of topic paths tasks are filed under.
//!
//! The taxonomy lives in one JSON object in the blob store. [`TaxonomyCache`]
//! keeps the parsed document for a fixed TTL and falls back to a built-in
//! default when the object is missing or unreadable.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_core::blob::BlobStore;
use strata_core::config::TaxonomyConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyTopic {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}

impl TaxonomyTopic {
    pub fn new(path: &str, description: &str) -> Self {
        Self {
            path: path.to_string(),
            description: description.to_string(),
            examples: Vec::new(),
        }
    }

    /// Last path segment: `Work/Projects` -> `Projects`.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.path.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        self.path.matches('/').count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub topics: Vec<TaxonomyTopic>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Taxonomy {
    fn default() -> Self {
        let mut projects = TaxonomyTopic::new("Work/Projects", "Project-specific tasks");
        projects.examples = vec!["feature development".to_string(), "bug fixes".to_string()];
        Self {
            version: default_version(),
            description: "Default topic taxonomy for task classification".to_string(),
            topics: vec![
                projects,
                TaxonomyTopic::new("Work/Meetings", "Meeting action items"),
                TaxonomyTopic::new("Work/Admin", "Administrative tasks"),
                TaxonomyTopic::new("Work/Finance", "Work-related financial tasks"),
                TaxonomyTopic::new("Personal/Health", "Health and wellness tasks"),
                TaxonomyTopic::new("Personal/Finance", "Personal financial tasks"),
                TaxonomyTopic::new("Personal/Learning", "Learning and development"),
                TaxonomyTopic::new("Personal/Journal", "Personal reflections and notes"),
                TaxonomyTopic::new("General", "Uncategorized tasks"),
            ],
            extra: Map::new(),
        }
    }
}

impl Taxonomy {
    /// One line per topic: `- path: description (e.g., a, b)`.
    pub fn format_for_prompt(&self) -> String {
        self.topics
            .iter()
            .map(|topic| {
                let mut line = format!("- {}", topic.path);
                if !topic.description.is_empty() {
                    line.push_str(&format!(": {}", topic.description));
                }
                if !topic.examples.is_empty() {
                    line.push_str(&format!(" (e.g., {})", topic.examples.join(", ")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxonomyOrigin {
    /// Parsed from the stored object.
    Stored,
    /// Built-in fallback.
    Default,
}

/// A cached taxonomy and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxonomySnapshot {
    pub origin: TaxonomyOrigin,
    pub object: String,
    pub loaded_at: String,
    #[serde(flatten)]
    pub taxonomy: Taxonomy,
}

/// TTL cache over the taxonomy object. Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct TaxonomyCache {
    store: Arc<dyn BlobStore>,
    object: String,
    ttl: Duration,
    entries: Cache<String, Arc<TaxonomySnapshot>>,
}

impl TaxonomyCache {
    pub fn new(store: Arc<dyn BlobStore>, config: &TaxonomyConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_seconds);
        let entries = Cache::builder().time_to_live(ttl).build();
        Self {
            store,
            object: config.object.clone(),
            ttl,
            entries,
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached taxonomy, loading it on a miss or after the TTL. A zero TTL
    /// disables caching.
    pub async fn get(&self) -> Arc<TaxonomySnapshot> {
        if self.ttl.is_zero() {
            return self.load().await;
        }
        self.entries
            .get_with(self.object.clone(), self.load())
            .await
    }

    /// Drop the cached entry and load again.
    pub async fn refresh(&self) -> Arc<TaxonomySnapshot> {
        self.invalidate().await;
        self.get().await
    }

    pub async fn invalidate(&self) {
        self.entries.invalidate(&self.object).await;
    }

    async fn load(&self) -> Arc<TaxonomySnapshot> {
        let loaded_at = chrono::Utc::now().to_rfc3339();
        let stored = match self.store.get(&self.object).await {
            Ok(Some(blob)) => match serde_json::from_slice::<Taxonomy>(&blob.data) {
                Ok(taxonomy) => {
                    tracing::info!(
                        event = "taxonomy_loaded",
                        object = %self.object,
                        topic_count = taxonomy.topics.len(),
                        version = %taxonomy.version,
                        "Loaded topic taxonomy"
                    );
                    Some(taxonomy)
                }
                Err(e) => {
                    tracing::warn!(event = "taxonomy_load_error", object = %self.object, error = %e, "Malformed topic taxonomy, using defaults");
                    None
                }
            },
            Ok(None) => {
                tracing::info!(event = "taxonomy_default", object = %self.object, "No topic taxonomy stored, using defaults");
                None
            }
            Err(e) => {
                tracing::warn!(event = "taxonomy_load_error", object = %self.object, error = %e, "Could not read topic taxonomy, using defaults");
                None
            }
        };

        let (origin, taxonomy) = match stored {
            Some(taxonomy) => (TaxonomyOrigin::Stored, taxonomy),
            None => (TaxonomyOrigin::Default, Taxonomy::default()),
        };
        Arc::new(TaxonomySnapshot {
            origin,
            object: self.object.clone(),
            loaded_at,
            taxonomy,
        })
    }
}
