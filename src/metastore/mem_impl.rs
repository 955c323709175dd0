use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::*;
use crate::sync::{read_unpoisoned, write_unpoisoned};

#[derive(Debug, Default)]
pub struct MemMetaStore {
    chunks: RwLock<HashMap<String, ChunkMetadata>>,
    jobs: RwLock<HashMap<String, BackupJob>>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_job(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut BackupJob),
    ) -> Result<(), MetaStoreError> {
        let mut jobs = write_unpoisoned(&self.jobs, "metastore.jobs");
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| MetaStoreError::JobNotFound(job_id.into()))?;
        f(job);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemMetaStore {
    async fn get_chunk(&self, fingerprint: &str) -> Result<Option<ChunkMetadata>, MetaStoreError> {
        let chunks = read_unpoisoned(&self.chunks, "metastore.chunks");
        Ok(chunks.get(fingerprint).cloned())
    }

    async fn insert_chunk(&self, metadata: &ChunkMetadata) -> Result<bool, MetaStoreError> {
        let mut chunks = write_unpoisoned(&self.chunks, "metastore.chunks");
        if chunks.contains_key(&metadata.fingerprint) {
            return Ok(false);
        }
        chunks.insert(metadata.fingerprint.clone(), metadata.clone());
        Ok(true)
    }

    async fn touch_chunk(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<(), MetaStoreError> {
        let mut chunks = write_unpoisoned(&self.chunks, "metastore.chunks");
        if let Some(chunk) = chunks.get_mut(fingerprint) {
            chunk.last_referenced_time = at;
        }
        Ok(())
    }

    async fn create_job(&self, job: &BackupJob) -> Result<(), MetaStoreError> {
        let mut jobs = write_unpoisoned(&self.jobs, "metastore.jobs");
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BackupJob>, MetaStoreError> {
        let jobs = read_unpoisoned(&self.jobs, "metastore.jobs");
        Ok(jobs.get(job_id).cloned())
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: &str,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), MetaStoreError> {
        self.update_job(job_id, |job| {
            job.status = status.into();
            job.end_time = end_time;
        })
    }

    async fn set_files_metadata(
        &self,
        job_id: &str,
        files: &[FileManifest],
    ) -> Result<(), MetaStoreError> {
        self.update_job(job_id, |job| job.files_metadata = files.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_metastore() {
        let store = MemMetaStore::new();
        testutil::exercise_store(&store).await;
    }
}
