use crate::config::StorageSettings;
use crate::types::BlobHash;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Content-addressed storage for dataset files and run artifacts.
/// Blobs are immutable; writing known content is a no-op.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its content hash
    async fn put(&self, data: Bytes) -> Result<BlobHash>;

    /// Content of a blob, `None` if it is not stored
    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>>;

    /// Whether a blob is stored
    async fn contains(&self, hash: &BlobHash) -> Result<bool>;
}

/// Blob store for the configured storage: an S3 bucket when `s3_bucket` is
/// set, otherwise a directory under the data directory
pub fn open_blob_store(storage: &StorageSettings) -> Result<Arc<dyn BlobStore>> {
    match &storage.s3_bucket {
        Some(bucket) => {
            let s3 = object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .with_context(|| format!("Failed to configure S3 bucket {}", bucket))?;
            tracing::info!(bucket = %bucket, prefix = %storage.blob_dir, "Using S3 blob store");
            Ok(Arc::new(ObjectStoreBlobStore::new(Arc::new(s3), storage.blob_dir.clone())))
        }
        None => Ok(Arc::new(FilesystemBlobStore::new(
            storage.data_dir.join(&storage.blob_dir),
        )?)),
    }
}

/// Two-character fan-out keeps directories small: `ab/abcdef...`
fn fan_out(hash: &BlobHash) -> (&str, &str) {
    let full = hash.0.as_str();
    (full.get(..2).unwrap_or(full), full)
}

/// Blobs as files under a local directory
#[derive(Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create blob directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_of(&self, hash: &BlobHash) -> PathBuf {
        let (shard, name) = fan_out(hash);
        self.root.join(shard).join(name)
    }
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        let path = self.path_of(&hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(hash);
        }

        let shard = path
            .parent()
            .with_context(|| format!("Blob path {} has no parent", path.display()))?;
        tokio::fs::create_dir_all(shard)
            .await
            .with_context(|| format!("Failed to create {}", shard.display()))?;

        // Concurrent writers of the same content race on the rename, never on a partial file
        let staging = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&staging)
            .await
            .context("Failed to stage blob")?;
        file.write_all(&data).await.context("Failed to write blob")?;
        file.sync_all().await.context("Failed to sync blob")?;
        tokio::fs::rename(&staging, &path)
            .await
            .context("Failed to move blob into place")?;

        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_of(hash)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob {}", hash)),
        }
    }

    async fn contains(&self, hash: &BlobHash) -> Result<bool> {
        tokio::fs::try_exists(self.path_of(hash))
            .await
            .with_context(|| format!("Failed to look up blob {}", hash))
    }
}

/// Blobs in any `object_store` backend, so remote workers can share them
pub struct ObjectStoreBlobStore {
    store: Arc<dyn object_store::ObjectStore>,
    prefix: String,
}

impl ObjectStoreBlobStore {
    pub fn new(store: Arc<dyn object_store::ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn location(&self, hash: &BlobHash) -> object_store::path::Path {
        let (shard, name) = fan_out(hash);
        object_store::path::Path::from(format!("{}/{}/{}", self.prefix, shard, name))
    }
}

#[async_trait::async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        if self.contains(&hash).await? {
            return Ok(hash);
        }

        self.store
            .put(&self.location(&hash), data.into())
            .await
            .with_context(|| format!("Failed to upload blob {}", hash))?;
        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        match self.store.get(&self.location(hash)).await {
            Ok(result) => Ok(Some(
                result
                    .bytes()
                    .await
                    .with_context(|| format!("Failed to download blob {}", hash))?,
            )),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to fetch blob {}", hash)),
        }
    }

    async fn contains(&self, hash: &BlobHash) -> Result<bool> {
        match self.store.head(&self.location(hash)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to look up blob {}", hash)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_filesystem_store_fans_out_by_hash() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(temp_dir.path().join("blobs")).unwrap();

        let data = Bytes::from("WELL_1,0.5\nWELL_2,0.7\n");
        let hash = store.put(data.clone()).await.unwrap();
        assert_eq!(store.put(data.clone()).await.unwrap(), hash);
        assert!(temp_dir.path().join("blobs").join(&hash.0[..2]).join(&hash.0).is_file());

        assert!(store.contains(&hash).await.unwrap());
        assert_eq!(store.get(&hash).await.unwrap().unwrap(), data);

        let unknown = BlobHash::from_bytes(b"never stored");
        assert!(!store.contains(&unknown).await.unwrap());
        assert!(store.get(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_object_store_backend() {
        let store = ObjectStoreBlobStore::new(Arc::new(object_store::memory::InMemory::new()), "blobs");

        let payload = Bytes::from(r#"{"processing_errors":["WELL3"]}"#);
        let hash = store.put(payload.clone()).await.unwrap();
        assert!(store.contains(&hash).await.unwrap());
        assert_eq!(store.get(&hash).await.unwrap().unwrap(), payload);

        let unknown = BlobHash::from_bytes(b"never stored");
        assert!(!store.contains(&unknown).await.unwrap());
        assert!(store.get(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_storage_is_local() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = crate::config::Settings::default();
        settings.storage.data_dir = temp_dir.path().to_path_buf();

        let store = open_blob_store(&settings.storage).unwrap();
        let hash = store.put(Bytes::from("x")).await.unwrap();
        assert!(settings.blob_path().join(&hash.0[..2]).join(&hash.0).is_file());
    }
}
