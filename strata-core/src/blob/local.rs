use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{Blob, BlobStore, Precondition};
use crate::error::{GraphError, Result};

/// Directory-backed store. Keys map to relative paths under `root`;
/// the generation is a hash of the file contents.
///
/// Generation preconditions are checked under an in-process lock, so one
/// process at a time may write a given root. Deployments with several
/// writers share a `gcs` store instead.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Keys must be relative paths made of plain segments.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let path = Path::new(key);
        let plain = !key.is_empty()
            && !path.is_absolute()
            && path.components().all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(GraphError::Validation(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(path))
    }

    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn content_generation(data: &[u8]) -> i64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    // Keep it positive so it reads like a GCS generation.
    (hasher.finish() >> 1) as i64
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        let path = self.path_for(key)?;
        Ok(self.read(&path).await?.map(|data| Blob {
            generation: content_generation(&data),
            data: Bytes::from(data),
        }))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        _content_type: &str,
        condition: Precondition,
    ) -> Result<i64> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read(&path).await?.map(|d| content_generation(&d));
        condition.check(key, current)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(content_generation(&data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let start = match prefix.rfind('/') {
            Some(i) => self.root.join(&prefix[..i]),
            None => self.root.clone(),
        };

        let mut keys = Vec::new();
        let mut dirs = vec![start];
        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    dirs.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) && !key.contains(".tmp-") {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "local"
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}
