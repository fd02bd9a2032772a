pub mod backend;
pub mod blob;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod service;

pub use backend::{create_backend, BackendProvider, BlobFileBackend, GraphBackend, Neo4jBackend};
pub use blob::{create_store, BlobStore};
pub use clock::Clock;
pub use config::StrataConfig;
pub use error::{GraphError, Result};
pub use service::{format_for_llm, ContextFormat, GraphService, RetrievalMode, SubgraphService};
