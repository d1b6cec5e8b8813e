//! Filesystem-backed object store for local development and tests
//!
//! Lays objects out as `<root>/<bucket>/<key>` and mirrors the S3 store's
//! contract, including confirmed uploads and ranged reads.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use super::{ObjectStore, StorageError};
use crate::pipeline::{ArtifactStore, StageError};

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    bucket: String,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.to_string(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ArtifactStore for FsStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn store(&self, key: &str, path: &Path) -> Result<(), StageError> {
        let dest = self.object_path(&self.bucket, key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StageError::from_io)?;
        }

        // Copy then rename so a concurrent reader never observes a partial
        // object under the final key
        let partial = dest.with_extension("partial");
        tokio::fs::copy(path, &partial)
            .await
            .map_err(StageError::from_io)?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(StageError::from_io)?;

        info!("Stored artifact at {}", dest.display());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsStorage {
    async fn read_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.display().to_string())
            } else {
                StorageError::Backend(e.to_string())
            }
        })?;

        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        debug!("Read {} bytes from {}", buf.len(), path.display());
        Ok(buf)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| StorageError::Backend(format!("storage root unavailable: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_then_ranged_read() {
        let root = tempfile::tempdir().unwrap();
        let store = FsStorage::new(root.path(), "cogs");

        let src = root.path().join("artifact.tif");
        tokio::fs::write(&src, b"0123456789").await.unwrap();
        store.store("cogs/scene_rgb.tif", &src).await.unwrap();

        let chunk = store
            .read_range("cogs", "cogs/scene_rgb.tif", 2, 4)
            .await
            .unwrap();
        assert_eq!(chunk, b"2345");
    }

    #[tokio::test]
    async fn test_short_read_at_end_of_object() {
        let root = tempfile::tempdir().unwrap();
        let store = FsStorage::new(root.path(), "cogs");

        let src = root.path().join("artifact.tif");
        tokio::fs::write(&src, b"abcdef").await.unwrap();
        store.store("k.tif", &src).await.unwrap();

        let chunk = store.read_range("cogs", "k.tif", 4, 100).await.unwrap();
        assert_eq!(chunk, b"ef");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = FsStorage::new(root.path(), "cogs");

        let err = store.read_range("cogs", "absent.tif", 0, 16).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
