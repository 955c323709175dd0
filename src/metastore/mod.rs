use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MetaStoreError;

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::FjallMetaStore;
pub use mem_impl::MemMetaStore;

/// Where a chunk lives and when it was last referenced. Keyed by `fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub fingerprint: String,
    pub storage_location: String,
    pub size: u64,
    pub creation_time: DateTime<Utc>,
    pub last_referenced_time: DateTime<Utc>,
}

impl ChunkMetadata {
    pub fn new(fingerprint: impl Into<String>, storage_location: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.into(),
            storage_location: storage_location.into(),
            size,
            creation_time: now,
            last_referenced_time: now,
        }
    }
}

/// The chunk sequence of one completed file within a backup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub path: String,
    pub size: u64,
    pub chunks: Vec<String>,
}

/// Durable record of a backup job. Keyed by `job_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub job_id: String,
    pub client_id: String,
    pub backup_policy_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub source_type: String,
    pub source_details: String,
    pub files_metadata: Vec<FileManifest>,
}

/// The system of record for chunk locations and backup jobs.
///
/// Calls may block on I/O; callers must not hold the dedup index lock across them.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_chunk(&self, fingerprint: &str) -> Result<Option<ChunkMetadata>, MetaStoreError>;

    /// Inserts `metadata` unless a record for its fingerprint exists already.
    ///
    /// Returns `true` if the record was inserted.
    async fn insert_chunk(&self, metadata: &ChunkMetadata) -> Result<bool, MetaStoreError>;

    /// Refreshes `last_referenced_time`. Unknown fingerprints are ignored.
    async fn touch_chunk(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<(), MetaStoreError>;

    async fn create_job(&self, job: &BackupJob) -> Result<(), MetaStoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<BackupJob>, MetaStoreError>;

    async fn update_job_status(
        &self,
        job_id: &str,
        status: &str,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), MetaStoreError>;

    async fn set_files_metadata(
        &self,
        job_id: &str,
        files: &[FileManifest],
    ) -> Result<(), MetaStoreError>;
}
