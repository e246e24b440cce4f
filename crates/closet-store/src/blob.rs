//! Object storage for uploads and crops.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use closet_core::{Error, Result};

/// Bucketed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `bucket/key`, replacing any existing object.
    /// Returns a reference string for the stored object.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Object store backed by a local directory, one subdirectory per bucket.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        for part in [bucket, key] {
            let path = Path::new(part);
            let clean = !part.is_empty()
                && path
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !clean {
                return Err(Error::Validation(format!("invalid object path '{}'", part)));
            }
        }
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        // Write then rename so readers never see a half-written object.
        // The temp name keeps the full key so sibling keys never share it.
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(format!(".{}.part", Uuid::new_v4().simple()));
        let tmp = path.with_file_name(tmp_name);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
        debug!("Stored {} bytes at {}/{}", bytes.len(), bucket, key);
        Ok(format!("{}/{}", bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}/{}", bucket, key)))
            }
            Err(e) => Err(Error::Storage(format!("{}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());

        let reference = store.put("images", "crops/a/0.png", vec![1, 2, 3]).await.unwrap();
        assert_eq!(reference, "images/crops/a/0.png");
        store.put("images", "crops/a/0.png", vec![9]).await.unwrap();
        assert_eq!(store.get("images", "crops/a/0.png").await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_keys_differing_by_extension() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));

        let png = {
            let store = store.clone();
            tokio::spawn(async move { store.put("images", "x.png", vec![1; 4096]).await })
        };
        let jpg = {
            let store = store.clone();
            tokio::spawn(async move { store.put("images", "x.jpg", vec![2; 4096]).await })
        };
        png.await.unwrap().unwrap();
        jpg.await.unwrap().unwrap();

        assert_eq!(store.get("images", "x.png").await.unwrap(), vec![1; 4096]);
        assert_eq!(store.get("images", "x.jpg").await.unwrap(), vec![2; 4096]);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("images"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store.get("images", "nope.png").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.put("images", "../x.png", vec![1]).await.is_err());
        assert!(store.put("", "x.png", vec![1]).await.is_err());
        assert!(store.get("images", "/etc/passwd").await.is_err());
    }
}
