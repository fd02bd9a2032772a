//! Object storage underneath the blob-file backend.
//!
//! Every object carries a generation number. Writes take a [`Precondition`]
//! so a read-modify-write cycle can detect that another writer got there
//! first instead of silently overwriting it.

mod gcs;
mod local;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{BlobConfig, StoreKind};
use crate::error::{GraphError, Result};

pub use gcs::{GcsBlobStore, GcsConfig};
pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

pub const JSONL_CONTENT_TYPE: &str = "application/jsonl";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Object contents plus the generation they were read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub data: Bytes,
    pub generation: i64,
}

impl Blob {
    pub fn text(&self, key: &str) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| GraphError::storage(key, format!("object is not UTF-8: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write.
    None,
    /// Only create; fail if the object exists.
    DoesNotExist,
    /// Only overwrite the given generation.
    GenerationMatch(i64),
}

impl Precondition {
    /// Precondition matching a previous read: the generation seen, or
    /// "still absent" when nothing was there.
    pub fn from_observed(generation: Option<i64>) -> Self {
        match generation {
            Some(g) => Precondition::GenerationMatch(g),
            None => Precondition::DoesNotExist,
        }
    }

    pub(crate) fn check(&self, key: &str, current: Option<i64>) -> Result<()> {
        let ok = match (self, current) {
            (Precondition::None, _) => true,
            (Precondition::DoesNotExist, None) => true,
            (Precondition::DoesNotExist, Some(_)) => false,
            (Precondition::GenerationMatch(want), Some(have)) => *want == have,
            (Precondition::GenerationMatch(_), None) => false,
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::Conflict {
                path: key.to_string(),
            })
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `None` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Option<Blob>>;

    /// Write the whole object; returns the new generation.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        condition: Precondition,
    ) -> Result<i64>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Store name for logging and stats.
    fn name(&self) -> &str;

    /// Bucket or root directory, for stats.
    fn location(&self) -> String;
}

/// Create the configured store.
pub fn create_store(config: &BlobConfig) -> Result<Arc<dyn BlobStore>> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        StoreKind::Local => Ok(Arc::new(LocalBlobStore::new(config.expanded_root()))),
        StoreKind::Gcs => {
            if config.bucket.is_empty() {
                return Err(GraphError::Validation(
                    "blob.bucket is required for the gcs store".to_string(),
                ));
            }
            let mut gcs = GcsConfig::new(&config.bucket, config.resolved_token());
            if let Some(base_url) = &config.base_url {
                gcs.base_url = base_url.clone();
            }
            Ok(Arc::new(GcsBlobStore::new(gcs)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_matrix() {
        assert!(Precondition::None.check("k", Some(3)).is_ok());
        assert!(Precondition::DoesNotExist.check("k", None).is_ok());
        assert!(Precondition::DoesNotExist.check("k", Some(1)).is_err());
        assert!(Precondition::GenerationMatch(2).check("k", Some(2)).is_ok());
        assert!(Precondition::GenerationMatch(2).check("k", Some(3)).is_err());
        assert!(Precondition::GenerationMatch(2).check("k", None).is_err());
    }

    #[test]
    fn test_from_observed() {
        assert_eq!(Precondition::from_observed(None), Precondition::DoesNotExist);
        assert_eq!(
            Precondition::from_observed(Some(9)),
            Precondition::GenerationMatch(9)
        );
    }

    #[test]
    fn test_gcs_requires_bucket() {
        let config = BlobConfig {
            store: StoreKind::Gcs,
            ..BlobConfig::default()
        };
        assert!(matches!(create_store(&config), Err(GraphError::Validation(_))));
    }
}
