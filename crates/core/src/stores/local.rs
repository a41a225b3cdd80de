use crate::error::StorageError;
use crate::traits::ObjectStorage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Object storage backed by local directories, one per bucket.
#[derive(Debug, Clone, Default)]
pub struct LocalObjectStorage {
    buckets: HashMap<String, PathBuf>,
}

impl LocalObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.buckets.insert(name.into(), root.into());
        self
    }

    fn resolve(&self, bucket: &str, path: &str) -> Result<PathBuf, StorageError> {
        let root = self
            .buckets
            .get(bucket)
            .ok_or_else(|| StorageError::UnknownBucket(bucket.to_string()))?;

        let relative = Path::new(path);
        let escapes = path.is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        Ok(root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn fetch(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        let full_path = self.resolve(bucket, path)?;
        match tokio::fs::read(&full_path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            }),
            Err(error) => Err(StorageError::Io(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_files_inside_the_bucket() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("case-1")).unwrap();
        std::fs::write(root.path().join("case-1/inicial.txt"), b"conteudo").unwrap();

        let storage = LocalObjectStorage::new().with_bucket("documents", root.path());
        let bytes = storage.fetch("documents", "case-1/inicial.txt").await.unwrap();
        assert_eq!(bytes, b"conteudo");
    }

    #[tokio::test]
    async fn rejects_unknown_buckets_and_escaping_paths() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new().with_bucket("documents", root.path());

        assert!(matches!(
            storage.fetch("other", "a.txt").await,
            Err(StorageError::UnknownBucket(_))
        ));
        for path in ["../secret.txt", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(storage.fetch("documents", path).await, Err(StorageError::InvalidPath(_))),
                "{path}"
            );
        }
        assert!(matches!(
            storage.fetch("documents", "missing.txt").await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
