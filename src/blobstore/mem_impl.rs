use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use super::BlobStore;
use crate::error::StoreError;
use crate::sync::{read_unpoisoned, write_unpoisoned};

#[derive(Debug, Default)]
pub struct MemBlobStore {
    bucket: String,
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            blobs: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.blobs, "blobs").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    fn location(&self, fingerprint: &str) -> String {
        format!("mem://{}/{fingerprint}", self.bucket)
    }

    async fn store_blob(&self, fingerprint: &str, blob: Bytes) -> Result<(), StoreError> {
        write_unpoisoned(&self.blobs, "blobs")
            .entry(fingerprint.to_owned())
            .or_insert(blob);
        Ok(())
    }

    async fn fetch_blob(&self, fingerprint: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(read_unpoisoned(&self.blobs, "blobs").get(fingerprint).cloned())
    }

    async fn blob_size(&self, fingerprint: &str) -> Result<Option<u64>, StoreError> {
        let blobs = read_unpoisoned(&self.blobs, "blobs");
        Ok(blobs.get(fingerprint).map(|blob| blob.len() as u64))
    }
}
