use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use super::BlobStore;
use crate::error::StoreError;

/// Blobs as files under `<data_dir>/<bucket>/<fp[..2]>/<fp>`.
///
/// Writes go to a temp file in the bucket root and are renamed into place,
/// so a blob is either absent or complete.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    bucket: String,
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens the bucket directory, creating it if needed.
    pub fn open(data_dir: impl AsRef<Path>, bucket: &str) -> Result<Self, StoreError> {
        let root = data_dir.as_ref().join(bucket);
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            bucket: bucket.to_owned(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, fingerprint: &str) -> PathBuf {
        match fingerprint.get(..2) {
            Some(prefix) if fingerprint.len() > 2 => self.root.join(prefix).join(fingerprint),
            _ => self.root.join(fingerprint),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    fn location(&self, fingerprint: &str) -> String {
        format!("fs://{}/{fingerprint}", self.bucket)
    }

    async fn store_blob(&self, fingerprint: &str, blob: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(fingerprint);
        if tokio::fs::try_exists(&path).await? {
            debug!(fingerprint, "blob already present");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        if let Err(err) = tokio::fs::write(&tmp_path, &blob).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(fingerprint, size = blob.len(), path = %path.display(), "stored blob");
        Ok(())
    }

    async fn fetch_blob(&self, fingerprint: &str) -> Result<Option<Bytes>, StoreError> {
        match tokio::fs::read(self.blob_path(fingerprint)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn blob_size(&self, fingerprint: &str) -> Result<Option<u64>, StoreError> {
        match tokio::fs::metadata(self.blob_path(fingerprint)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
