use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::backend::{ChunkStore, FetchedChunk, StoredChunk};
use crate::blobstore::BlobStore;
use crate::error::StoreError;

/// Rejects fingerprints that are empty or not usable as an object key.
pub fn validate_fingerprint(fingerprint: &str) -> Result<(), StoreError> {
    if fingerprint.is_empty() {
        return Err(StoreError::InvalidArgument("fingerprint is required".into()));
    }
    let valid = fingerprint
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(StoreError::InvalidArgument(format!(
            "fingerprint '{fingerprint}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Stores and serves chunk bytes keyed by fingerprint.
pub struct StorageNode {
    node_id: String,
    blobs: Arc<dyn BlobStore>,
}

impl StorageNode {
    pub fn new(node_id: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            node_id: node_id.into(),
            blobs,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn store(&self, fingerprint: &str, data: Bytes) -> Result<StoredChunk, StoreError> {
        validate_fingerprint(fingerprint)?;
        if data.is_empty() {
            return Err(StoreError::InvalidArgument("chunk_data is required".into()));
        }

        let size = data.len();
        if let Err(err) = self.blobs.store_blob(fingerprint, data).await {
            warn!(fingerprint, error = %err, "failed to store chunk");
            return Err(err);
        }
        debug!(fingerprint, size, "stored chunk");

        Ok(StoredChunk {
            storage_location: self.blobs.location(fingerprint),
            storage_node_id: self.node_id.clone(),
        })
    }

    pub async fn fetch(&self, fingerprint: &str) -> Result<Option<FetchedChunk>, StoreError> {
        validate_fingerprint(fingerprint)?;

        let data = self.blobs.fetch_blob(fingerprint).await.inspect_err(|err| {
            warn!(fingerprint, error = %err, "failed to fetch chunk");
        })?;
        Ok(data.map(|data| FetchedChunk {
            size: data.len() as u64,
            data,
        }))
    }
}

#[async_trait::async_trait]
impl ChunkStore for StorageNode {
    async fn store_chunk(&self, fingerprint: &str, data: Bytes) -> Result<StoredChunk, StoreError> {
        self.store(fingerprint, data).await
    }

    async fn fetch_chunk(&self, fingerprint: &str) -> Result<Option<FetchedChunk>, StoreError> {
        self.fetch(fingerprint).await
    }
}
