//! The ingest pipeline: drives one backup session per stream and runs every
//! completed file through chunking, deduplication and storage.

use std::pin::pin;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::backend::ChunkStore;
use crate::chunker::{Chunk, Chunker};
use crate::error::{IngestError, MetaStoreError};
use crate::index::DedupIndex;
use crate::metastore::{ChunkMetadata, FileManifest, MetadataStore};
use crate::protocol::{BackupRequest, BackupResponse, BackupStatus, EndBackup, FileSegment, StartBackup};
use crate::session::{BackupSession, SessionRegistry, SessionState, STATUS_ABORTED};

/// Shared services behind every backup stream of an ingest node.
pub struct Ingestor {
    chunker: Chunker,
    index: Arc<DedupIndex>,
    chunk_store: Arc<dyn ChunkStore>,
    metastore: Option<Arc<dyn MetadataStore>>,
    sessions: Arc<SessionRegistry>,
}

/// How a chunk was resolved against the dedup tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// Found in the in-memory index.
    Cached,
    /// Found in the metadata store.
    Known,
    /// Written to the chunk store.
    Stored,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        index: Arc<DedupIndex>,
        chunk_store: Arc<dyn ChunkStore>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            chunker,
            index,
            chunk_store,
            metastore: None,
            sessions,
        }
    }

    pub fn with_metastore(mut self, metastore: Arc<dyn MetadataStore>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Starts a fresh, idle session for a new stream.
    pub fn open_stream(self: &Arc<Self>) -> BackupStream {
        BackupStream {
            ingestor: Arc::clone(self),
            state: SessionState::Idle,
        }
    }

    /// Chunks a completed file and deduplicates every chunk, updating the
    /// session's counters and recording the file's manifest.
    async fn process_file(&self, session: &mut BackupSession, file_path: &str) -> Result<(), IngestError> {
        let (data, declared_size) = session.take_file(file_path).unwrap_or_default();
        let size = data.len() as u64;
        if declared_size != size {
            debug!(file_path, declared_size, size, "file size differs from declared size");
        }

        let chunker = self.chunker.clone();
        let chunks = tokio::task::spawn_blocking(move || chunker.chunk(data))
            .await
            .map_err(|err| IngestError::Internal(format!("chunking '{file_path}' failed: {err}")))?;

        // Counters reach the session only once every chunk of the file is resolved.
        let mut fingerprints = Vec::with_capacity(chunks.len());
        let mut bytes_deduplicated = 0u64;
        let mut deduplicated = 0usize;
        for chunk in &chunks {
            if self.resolve_chunk(session, chunk).await? != Resolution::Stored {
                bytes_deduplicated += chunk.size;
                deduplicated += 1;
            }
            fingerprints.push(chunk.fingerprint.clone());
        }

        session.files_processed += 1;
        session.chunks_processed += chunks.len() as u64;
        session.bytes_processed += chunks.iter().map(|chunk| chunk.size).sum::<u64>();
        session.bytes_deduplicated += bytes_deduplicated;
        session.record_file(FileManifest {
            path: file_path.to_owned(),
            size,
            chunks: fingerprints,
        });

        debug!(
            job_id = %session.job_id,
            file_path,
            size,
            chunks = chunks.len(),
            deduplicated,
            "processed file"
        );
        Ok(())
    }

    /// Looks a chunk up in the index, then the metadata store, and stores it
    /// if neither knows it.
    async fn resolve_chunk(&self, session: &mut BackupSession, chunk: &Chunk) -> Result<Resolution, IngestError> {
        let fingerprint = chunk.fingerprint.as_str();

        if self.index.get(fingerprint).is_some() {
            debug!(fingerprint, "duplicate chunk (index)");
            return Ok(Resolution::Cached);
        }
        if self.index.might_contain(fingerprint) {
            trace!(fingerprint, "filter hit without cache entry");
        }

        if let Some(metastore) = self.live_metastore(session) {
            match metastore.get_chunk(fingerprint).await {
                Ok(Some(known)) => {
                    self.index.put(fingerprint, known);
                    if let Err(err) = metastore.touch_chunk(fingerprint, Utc::now()).await {
                        degrade(session, "touch_chunk", &err);
                    }
                    debug!(fingerprint, "duplicate chunk (metadata store)");
                    return Ok(Resolution::Known);
                }
                Ok(None) => {}
                Err(err) => degrade(session, "get_chunk", &err),
            }
        }

        let stored = self
            .chunk_store
            .store_chunk(fingerprint, chunk.data.clone())
            .await
            .map_err(|source| IngestError::Storage {
                fingerprint: fingerprint.to_owned(),
                source,
            })?;

        let metadata = ChunkMetadata::new(fingerprint, stored.storage_location, chunk.size);
        self.index.put(fingerprint, metadata.clone());
        if let Some(metastore) = self.live_metastore(session) {
            if let Err(err) = metastore.insert_chunk(&metadata).await {
                degrade(session, "insert_chunk", &err);
            }
        }
        Ok(Resolution::Stored)
    }

    fn live_metastore(&self, session: &BackupSession) -> Option<Arc<dyn MetadataStore>> {
        self.metastore
            .as_ref()
            .filter(|_| !session.metastore_degraded)
            .cloned()
    }
}

/// Stops consulting the metadata store for the rest of the job, unless the
/// failure was only a lost write race.
fn degrade(session: &mut BackupSession, operation: &str, err: &MetaStoreError) {
    if matches!(err, MetaStoreError::Conflict) {
        debug!(job_id = %session.job_id, operation, "metadata store write lost a race");
        return;
    }
    warn!(
        job_id = %session.job_id,
        operation,
        error = %err,
        "metadata store failed; deduplicating from the index only for the rest of this job"
    );
    session.metastore_degraded = true;
}

/// One client stream's view of the pipeline.
pub struct BackupStream {
    ingestor: Arc<Ingestor>,
    state: SessionState,
}

impl BackupStream {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Applies one client event. Returns the status update to send back, if any.
    ///
    /// An error never moves the state machine, but the caller is expected to
    /// report it and end the stream.
    pub async fn handle(&mut self, request: BackupRequest) -> Result<Option<BackupStatus>, IngestError> {
        match request {
            BackupRequest::StartBackup(start) => self.start(start).await.map(Some),
            BackupRequest::FileSegment(segment) => self.segment(segment).await,
            BackupRequest::EndBackup(end) => self.end(end).await.map(Some),
        }
    }

    async fn start(&mut self, start: StartBackup) -> Result<BackupStatus, IngestError> {
        match &self.state {
            SessionState::Idle => {}
            SessionState::Active(session) => {
                return Err(IngestError::FailedPrecondition(format!(
                    "backup job '{}' is already active on this stream",
                    session.job_id
                )));
            }
            SessionState::Terminated => {
                return Err(IngestError::FailedPrecondition(
                    "backup already ended on this stream".into(),
                ));
            }
        }
        if start.job_id.is_empty() {
            return Err(IngestError::InvalidArgument("job_id is required".into()));
        }
        if start.client_id.is_empty() {
            return Err(IngestError::InvalidArgument("client_id is required".into()));
        }

        let session = BackupSession::new(&start);
        if !self.ingestor.sessions.try_register(session.snapshot()) {
            return Err(IngestError::FailedPrecondition(format!(
                "backup job '{}' is already active",
                session.job_id
            )));
        }

        if let Some(metastore) = &self.ingestor.metastore {
            if let Err(err) = metastore.create_job(&session.job_record(&start)).await {
                warn!(job_id = %session.job_id, error = %err, "failed to persist backup job");
            }
        }

        info!(
            job_id = %session.job_id,
            client_id = %session.client_id,
            policy_id = %session.policy_id,
            "backup initiated"
        );
        let status = session.status_update(None, "backup initiated".into());
        self.state = SessionState::Active(session);
        Ok(status)
    }

    async fn segment(&mut self, segment: FileSegment) -> Result<Option<BackupStatus>, IngestError> {
        let SessionState::Active(session) = &mut self.state else {
            return Err(IngestError::FailedPrecondition("no active backup job".into()));
        };
        if segment.file_path.is_empty() {
            return Err(IngestError::InvalidArgument("file_path is required".into()));
        }

        session.append_segment(&segment);
        if !segment.is_last_segment {
            return Ok(None);
        }

        self.ingestor.process_file(session, &segment.file_path).await?;
        self.ingestor.sessions.update(session.snapshot());

        Ok(Some(session.status_update(
            Some(segment.file_path.clone()),
            format!("processed file: {}", segment.file_path),
        )))
    }

    async fn end(&mut self, end: EndBackup) -> Result<BackupStatus, IngestError> {
        let SessionState::Active(session) = &mut self.state else {
            return Err(IngestError::FailedPrecondition("no active backup job".into()));
        };
        if !end.job_id.is_empty() && end.job_id != session.job_id {
            return Err(IngestError::InvalidArgument(format!(
                "end event for job '{}' does not match active job '{}'",
                end.job_id, session.job_id
            )));
        }
        if end.status.is_empty() {
            return Err(IngestError::InvalidArgument("status is required".into()));
        }

        if session.open_file_count() > 0 {
            warn!(
                job_id = %session.job_id,
                open_files = session.open_file_count(),
                "discarding files without a last segment"
            );
        }
        session.status = end.status;

        if let Some(metastore) = &self.ingestor.metastore {
            let job_id = session.job_id.as_str();
            if let Err(err) = metastore
                .update_job_status(job_id, &session.status, Some(Utc::now()))
                .await
            {
                warn!(job_id, error = %err, "failed to persist backup job status");
            } else if let Err(err) = metastore
                .set_files_metadata(job_id, session.completed_files())
                .await
            {
                warn!(job_id, error = %err, "failed to persist backup file manifests");
            }
        }
        self.ingestor.sessions.update(session.snapshot());

        info!(
            job_id = %session.job_id,
            status = %session.status,
            files = session.files_processed,
            chunks = session.chunks_processed,
            bytes_processed = session.bytes_processed,
            bytes_deduplicated = session.bytes_deduplicated,
            summary = %end.summary,
            "backup ended"
        );
        let status = session.status_update(
            None,
            format!(
                "backup completed: processed {} file(s), {} chunk(s)",
                session.files_processed, session.chunks_processed
            ),
        );
        self.state = SessionState::Terminated;
        Ok(status)
    }

    /// Ends the stream. A job still active is recorded as aborted.
    pub async fn close(self) {
        let SessionState::Active(mut session) = self.state else {
            return;
        };
        session.status = STATUS_ABORTED.to_owned();
        self.ingestor.sessions.update(session.snapshot());

        if let Some(metastore) = &self.ingestor.metastore {
            if let Err(err) = metastore
                .update_job_status(&session.job_id, STATUS_ABORTED, Some(Utc::now()))
                .await
            {
                warn!(job_id = %session.job_id, error = %err, "failed to persist aborted job");
            }
        }
        info!(
            job_id = %session.job_id,
            files = session.files_processed,
            open_files = session.open_file_count(),
            "stream closed before backup ended"
        );
    }
}

/// Drives one stream to completion, sending status updates in request order.
///
/// The first error is reported as a single error message and ends the stream.
pub async fn run_session<S>(ingestor: Arc<Ingestor>, requests: S, responses: mpsc::Sender<BackupResponse>)
where
    S: Stream<Item = Result<BackupRequest, IngestError>>,
{
    let mut stream = ingestor.open_stream();
    let mut requests = pin!(requests);

    while let Some(request) = requests.next().await {
        let outcome = match request {
            Ok(request) => stream.handle(request).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(Some(status)) => {
                if responses.send(BackupResponse::StatusUpdate(status)).await.is_err() {
                    debug!("client stopped reading responses");
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "backup stream failed");
                let _ = responses.send(BackupResponse::from(&err)).await;
                break;
            }
        }
    }

    stream.close().await;
}
