use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error at {path}: {message}")]
    Storage { path: String, message: String },

    #[error("Write conflict on {path}: object changed since it was read")]
    Conflict { path: String },

    #[error("Malformed record in {path} at line {line}: {source}")]
    Corrupt {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Graph database error: {0}")]
    Database(#[from] neo4rs::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        GraphError::NotFound {
            kind: "Node",
            id: id.into(),
        }
    }

    pub fn edge_not_found(id: impl Into<String>) -> Self {
        GraphError::NotFound {
            kind: "Edge",
            id: id.into(),
        }
    }

    pub fn storage(path: impl Into<String>, message: impl Into<String>) -> Self {
        GraphError::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stable name for logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphError::AlreadyExists(_) => "already_exists",
            GraphError::NotFound { .. } => "not_found",
            GraphError::Validation(_) => "validation",
            GraphError::Conflict { .. } => "conflict",
            GraphError::Corrupt { .. } => "corrupt",
            GraphError::Storage { .. }
            | GraphError::Database(_)
            | GraphError::Http(_)
            | GraphError::Io(_)
            | GraphError::Json(_) => "storage",
            GraphError::Config(_) => "config",
        }
    }

    /// A conflict or transport failure may succeed on a fresh attempt;
    /// everything else needs a different request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GraphError::Conflict { .. } | GraphError::Http(_) | GraphError::Database(_)
        )
    }
}
