use bytes::Bytes;

use crate::error::StoreError;

mod fs_impl;
mod mem_impl;

pub use fs_impl::FsBlobStore;
pub use mem_impl::MemBlobStore;

/// Content-addressed object store: blobs are keyed by chunk fingerprint.
///
/// Keys reaching a `BlobStore` have been validated by the storage node.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// The opaque locator recorded in chunk metadata.
    fn location(&self, fingerprint: &str) -> String;

    /// Stores `blob`. Storing an existing key again is a no-op.
    async fn store_blob(&self, fingerprint: &str, blob: Bytes) -> Result<(), StoreError>;

    async fn fetch_blob(&self, fingerprint: &str) -> Result<Option<Bytes>, StoreError>;

    async fn blob_size(&self, fingerprint: &str) -> Result<Option<u64>, StoreError>;

    async fn contains_blob(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.blob_size(fingerprint).await?.is_some())
    }
}
