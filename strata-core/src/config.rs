use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StrataConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub backend: BackendSelection,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub neo4j: Neo4jConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
    /// IANA zone used when stamping `created_at` / `updated_at`.
    pub timezone: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            timezone: "Pacific/Auckland".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Blob,
    Neo4j,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendSelection {
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Local,
    Gcs,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    #[serde(default)]
    pub store: StoreKind,
    /// Root directory for the local store (shell-expanded).
    pub root: String,
    pub bucket: String,
    /// Key prefix for graph files, e.g. `graph/`.
    pub prefix: String,
    /// Bearer token for GCS; falls back to `GCS_ACCESS_TOKEN`.
    pub token: Option<String>,
    pub base_url: Option<String>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Local,
            root: "~/.strata/data".to_string(),
            bucket: String::new(),
            prefix: "graph/".to_string(),
            token: None,
            base_url: None,
        }
    }
}

impl BlobConfig {
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("GCS_ACCESS_TOKEN").ok())
    }

    pub fn expanded_root(&self) -> String {
        shellexpand::tilde(&self.root).into_owned()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
    pub max_connections: usize,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: None,
            database: "neo4j".to_string(),
            max_connections: 16,
        }
    }
}

impl Neo4jConfig {
    pub fn resolved_password(&self) -> String {
        self.password
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var("NEO4J_PASSWORD").ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8770,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    pub default_depth: usize,
    pub max_nodes: usize,
    pub max_paths: usize,
    pub max_tokens: usize,
    pub relation_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_depth: 2,
            max_nodes: 100,
            max_paths: 10,
            max_tokens: 4000,
            relation_limit: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaxonomyConfig {
    pub object: String,
    pub ttl_seconds: u64,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            object: "topic_taxonomy.json".to_string(),
            ttl_seconds: 300,
        }
    }
}

impl StrataConfig {
    /// Load from a TOML file, then overlay `STRATA__SECTION__KEY` variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("STRATA").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Config for tests and ephemeral runs: in-memory blob store.
    pub fn in_memory() -> Self {
        Self {
            blob: BlobConfig {
                store: StoreKind::Memory,
                ..BlobConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[backend]
kind = "neo4j"

[neo4j]
uri = "neo4j+s://example.databases.neo4j.io"
username = "graph"
database = "neo4j"
max_connections = 4

[retrieval]
default_depth = 3
max_nodes = 40
max_paths = 5
max_tokens = 2000
relation_limit = 25
"#
        )
        .unwrap();

        let config = StrataConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Neo4j);
        assert_eq!(config.neo4j.max_connections, 4);
        assert_eq!(config.retrieval.max_nodes, 40);
        assert_eq!(config.service.timezone, "Pacific/Auckland");
        assert_eq!(config.blob.prefix, "graph/");
        assert_eq!(config.taxonomy.ttl_seconds, 300);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        assert!(StrataConfig::load("/nonexistent/strata-config").is_err());
    }

    #[test]
    fn test_explicit_token_wins_over_env() {
        let blob = BlobConfig {
            token: Some("explicit".to_string()),
            ..BlobConfig::default()
        };
        assert_eq!(blob.resolved_token().as_deref(), Some("explicit"));
    }

    #[test]
    fn test_in_memory_selects_memory_store() {
        let config = StrataConfig::in_memory();
        assert_eq!(config.blob.store, StoreKind::Memory);
        assert_eq!(config.backend.kind, BackendKind::Blob);
    }
}
