use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Blob, BlobStore, Precondition};
use crate::error::Result;

/// Process-local store. Generations increase monotonically across all keys.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Blob>>,
    counter: RwLock<i64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw write that bypasses preconditions, for seeding fixtures.
    pub async fn insert(&self, key: &str, data: impl Into<Bytes>) -> i64 {
        let generation = self.next_generation().await;
        self.objects.write().await.insert(
            key.to_string(),
            Blob {
                data: data.into(),
                generation,
            },
        );
        generation
    }

    async fn next_generation(&self) -> i64 {
        let mut counter = self.counter.write().await;
        *counter += 1;
        *counter
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        _content_type: &str,
        condition: Precondition,
    ) -> Result<i64> {
        let mut objects = self.objects.write().await;
        condition.check(key, objects.get(key).map(|b| b.generation))?;
        let generation = self.next_generation().await;
        objects.insert(key.to_string(), Blob { data, generation });
        Ok(generation)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
