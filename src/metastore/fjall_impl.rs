use std::path::Path;

use chrono::{DateTime, Utc};
use fjall::{TransactionalKeyspace, TransactionalPartitionHandle};

use super::*;

/// Metadata store on an embedded fjall keyspace, one partition per table.
///
/// Values are postcard-encoded records keyed by fingerprint or job id.
#[derive(Clone)]
pub struct FjallMetaStore {
    database: TransactionalKeyspace,
    chunks: TransactionalPartitionHandle,
    jobs: TransactionalPartitionHandle,
}

impl FjallMetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaStoreError> {
        let database = fjall::Config::new(path).open_transactional()?;
        let chunks = database.open_partition("chunks", Default::default())?;
        let jobs = database.open_partition("backup_jobs", Default::default())?;

        Ok(Self {
            database,
            chunks,
            jobs,
        })
    }

    fn read_chunk(&self, fingerprint: &str) -> Result<Option<ChunkMetadata>, MetaStoreError> {
        match self.chunks.get(fingerprint)? {
            Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    fn write_chunk_if_absent(&self, metadata: &ChunkMetadata) -> Result<bool, MetaStoreError> {
        let key = metadata.fingerprint.as_bytes();
        let value = postcard::to_stdvec(metadata)?;

        with_retries(|| {
            let mut write_tx = self.database.write_tx()?;
            if write_tx.contains_key(&self.chunks, key)? {
                return Ok(Some(false));
            }
            write_tx.insert(&self.chunks, key, value.clone());
            Ok(committed(write_tx.commit())?.then_some(true))
        })
    }

    fn write_touch(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<(), MetaStoreError> {
        with_retries(|| {
            let mut write_tx = self.database.write_tx()?;
            let Some(value) = write_tx.get(&self.chunks, fingerprint)? else {
                return Ok(Some(()));
            };
            let mut metadata: ChunkMetadata = postcard::from_bytes(&value)?;
            metadata.last_referenced_time = at;

            write_tx.insert(&self.chunks, fingerprint, postcard::to_stdvec(&metadata)?);
            Ok(committed(write_tx.commit())?.then_some(()))
        })
    }

    fn read_job(&self, job_id: &str) -> Result<Option<BackupJob>, MetaStoreError> {
        match self.jobs.get(job_id)? {
            Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    fn write_job(&self, job: &BackupJob) -> Result<(), MetaStoreError> {
        self.jobs
            .insert(job.job_id.as_bytes(), postcard::to_stdvec(job)?)?;
        Ok(())
    }

    /// Read-modify-write of one job record inside a single transaction.
    fn modify_job(
        &self,
        job_id: &str,
        mut f: impl FnMut(&mut BackupJob),
    ) -> Result<(), MetaStoreError> {
        with_retries(|| {
            let mut write_tx = self.database.write_tx()?;
            let value = write_tx
                .get(&self.jobs, job_id)?
                .ok_or_else(|| MetaStoreError::JobNotFound(job_id.into()))?;
            let mut job: BackupJob = postcard::from_bytes(&value)?;
            f(&mut job);

            write_tx.insert(&self.jobs, job_id, postcard::to_stdvec(&job)?);
            Ok(committed(write_tx.commit())?.then_some(()))
        })
    }
}

/// Commits attempted before a transaction that keeps losing races gives up.
const COMMIT_ATTEMPTS: usize = 32;

/// Whether a commit went through. `false` means a concurrent writer won.
fn committed<C>(result: Result<Result<(), C>, fjall::Error>) -> Result<bool, MetaStoreError> {
    Ok(result?.is_ok())
}

/// Re-runs `attempt` from a fresh snapshot while it reports a lost commit (`Ok(None)`).
fn with_retries<T>(
    mut attempt: impl FnMut() -> Result<Option<T>, MetaStoreError>,
) -> Result<T, MetaStoreError> {
    for _ in 0..COMMIT_ATTEMPTS {
        if let Some(value) = attempt()? {
            return Ok(value);
        }
    }
    Err(MetaStoreError::Conflict)
}

/// Runs a keyspace operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, MetaStoreError>
where
    F: FnOnce() -> Result<T, MetaStoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| MetaStoreError::Unavailable(err.to_string()))?
}

#[async_trait::async_trait]
impl MetadataStore for FjallMetaStore {
    async fn get_chunk(&self, fingerprint: &str) -> Result<Option<ChunkMetadata>, MetaStoreError> {
        let store = self.clone();
        let fingerprint = fingerprint.to_owned();
        blocking(move || store.read_chunk(&fingerprint)).await
    }

    async fn insert_chunk(&self, metadata: &ChunkMetadata) -> Result<bool, MetaStoreError> {
        let store = self.clone();
        let metadata = metadata.clone();
        blocking(move || store.write_chunk_if_absent(&metadata)).await
    }

    async fn touch_chunk(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<(), MetaStoreError> {
        let store = self.clone();
        let fingerprint = fingerprint.to_owned();
        blocking(move || store.write_touch(&fingerprint, at)).await
    }

    async fn create_job(&self, job: &BackupJob) -> Result<(), MetaStoreError> {
        let store = self.clone();
        let job = job.clone();
        blocking(move || store.write_job(&job)).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BackupJob>, MetaStoreError> {
        let store = self.clone();
        let job_id = job_id.to_owned();
        blocking(move || store.read_job(&job_id)).await
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: &str,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), MetaStoreError> {
        let store = self.clone();
        let job_id = job_id.to_owned();
        let status = status.to_owned();
        blocking(move || {
            store.modify_job(&job_id, |job| {
                job.status.clone_from(&status);
                job.end_time = end_time;
            })
        })
        .await
    }

    async fn set_files_metadata(
        &self,
        job_id: &str,
        files: &[FileManifest],
    ) -> Result<(), MetaStoreError> {
        let store = self.clone();
        let job_id = job_id.to_owned();
        let files = files.to_vec();
        blocking(move || store.modify_job(&job_id, |job| job.files_metadata.clone_from(&files))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fjall_metastore() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallMetaStore::open(tempdir.path()).unwrap();
        testutil::exercise_store(&store).await;
    }

    #[tokio::test]
    async fn job_updates_require_existing_job() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallMetaStore::open(tempdir.path()).unwrap();

        let result = store.set_files_metadata("missing", &[]).await;
        assert!(matches!(result, Err(MetaStoreError::JobNotFound(id)) if id == "missing"));
        assert_eq!(store.get_job("missing").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_do_not_conflict() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FjallMetaStore::open(tempdir.path()).unwrap();
        let writers = 8;
        let rounds = 20;
        let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(writers));

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    let mut won = Vec::new();
                    for round in 0..rounds {
                        let meta = ChunkMetadata::new(format!("fp{round}"), "loc", 4);
                        barrier.wait().await;
                        won.push(store.insert_chunk(&meta).await.unwrap());
                        store.touch_chunk(&meta.fingerprint, Utc::now()).await.unwrap();
                    }
                    won
                })
            })
            .collect();

        let mut winners = vec![0; rounds];
        for handle in handles {
            for (round, won) in handle.await.unwrap().into_iter().enumerate() {
                winners[round] += usize::from(won);
            }
        }
        assert!(winners.iter().all(|&n| n == 1), "{winners:?}");
        for round in 0..rounds {
            assert!(store.get_chunk(&format!("fp{round}")).await.unwrap().is_some());
        }
    }
}
