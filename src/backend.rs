use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Header carrying the stored size of a fetched chunk.
pub const CHUNK_SIZE_HEADER: &str = "x-chunk-size";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub storage_location: String,
    pub storage_node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChunk {
    pub data: Bytes,
    pub size: u64,
}

/// Body of a `PUT /chunks/{fingerprint}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChunkResponse {
    pub storage_location: String,
    pub storage_node_id: String,
    pub success: bool,
    pub error_message: String,
}

/// Where the ingest pipeline writes unique chunks.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    async fn store_chunk(&self, fingerprint: &str, data: Bytes) -> Result<StoredChunk, StoreError>;

    /// Returns `None` if no chunk is stored under `fingerprint`.
    async fn fetch_chunk(&self, fingerprint: &str) -> Result<Option<FetchedChunk>, StoreError>;
}

/// A storage node reached over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteStorageNode {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteStorageNode {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn chunk_url(&self, fingerprint: &str) -> String {
        format!("{}/chunks/{fingerprint}", self.base_url)
    }
}

async fn rejection(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::Remote(format!("{status}: {body}"))
}

#[async_trait::async_trait]
impl ChunkStore for RemoteStorageNode {
    async fn store_chunk(&self, fingerprint: &str, data: Bytes) -> Result<StoredChunk, StoreError> {
        let response = self
            .client
            .put(self.chunk_url(fingerprint))
            .body(data)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let stored: StoreChunkResponse = response.json().await?;
        if !stored.success {
            return Err(StoreError::Remote(stored.error_message));
        }

        Ok(StoredChunk {
            storage_location: stored.storage_location,
            storage_node_id: stored.storage_node_id,
        })
    }

    async fn fetch_chunk(&self, fingerprint: &str) -> Result<Option<FetchedChunk>, StoreError> {
        let response = self.client.get(self.chunk_url(fingerprint)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size = response
                    .headers()
                    .get(CHUNK_SIZE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let data = response.bytes().await?;
                Ok(Some(FetchedChunk {
                    size: size.unwrap_or(data.len() as u64),
                    data,
                }))
            }
            _ => Err(rejection(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blobstore::MemBlobStore;
    use crate::server::storage_router;
    use crate::storage_node::StorageNode;

    async fn spawn_storage_node() -> String {
        let blobs = Arc::new(MemBlobStore::new("dedupe-chunks"));
        let node = Arc::new(StorageNode::new("data-storage-node-1", blobs));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, storage_router(node)).await });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn remote_node_round_trip() {
        let remote = RemoteStorageNode::new(&spawn_storage_node().await).unwrap();
        let fp = crate::chunker::fingerprint(b"hello world");

        let stored = remote
            .store_chunk(&fp, Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        assert_eq!(stored.storage_location, format!("mem://dedupe-chunks/{fp}"));
        assert_eq!(stored.storage_node_id, "data-storage-node-1");

        let fetched = remote.fetch_chunk(&fp).await.unwrap().unwrap();
        assert_eq!(fetched.data, Bytes::from_static(b"hello world"));
        assert_eq!(fetched.size, 11);

        assert_eq!(remote.fetch_chunk("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remote_rejections_are_errors() {
        let remote = RemoteStorageNode::new(&spawn_storage_node().await).unwrap();

        let message = match remote.store_chunk("abc", Bytes::new()).await {
            Err(StoreError::Remote(message)) => message,
            other => panic!("expected a remote rejection, got {other:?}"),
        };
        assert!(message.contains("400"), "{message}");
    }
}
