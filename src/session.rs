//! Per-stream backup session state and the process-wide job registry.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metastore::{BackupJob, FileManifest};
use crate::protocol::{BackupStatus, FileSegment, StartBackup};
use crate::sync::{read_unpoisoned, write_unpoisoned};

pub const STATUS_INITIATED: &str = "INITIATED";
pub const STATUS_ABORTED: &str = "ABORTED";

/// Where one backup stream stands.
///
/// `Idle` until a start event, `Active` until an end event (or the stream
/// closing), `Terminated` afterwards. No event leaves `Terminated`.
#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Active(BackupSession),
    Terminated,
}

#[derive(Debug, Default)]
struct OpenFile {
    declared_size: u64,
    data: BytesMut,
}

/// Mutable state of the backup job active on one stream.
#[derive(Debug)]
pub struct BackupSession {
    pub job_id: String,
    pub client_id: String,
    pub policy_id: String,
    pub start_time: DateTime<Utc>,
    pub status: String,
    pub files_processed: u64,
    pub chunks_processed: u64,
    pub bytes_processed: u64,
    pub bytes_deduplicated: u64,
    /// Set after the first metadata store failure; chunk lookups then stay in the cache.
    pub metastore_degraded: bool,
    open_files: HashMap<String, OpenFile>,
    completed: Vec<FileManifest>,
}

impl BackupSession {
    pub fn new(start: &StartBackup) -> Self {
        let start_time = Utc
            .timestamp_opt(start.timestamp, 0)
            .single()
            .filter(|_| start.timestamp > 0)
            .unwrap_or_else(Utc::now);

        Self {
            job_id: start.job_id.clone(),
            client_id: start.client_id.clone(),
            policy_id: start.policy_id.clone(),
            start_time,
            status: STATUS_INITIATED.to_owned(),
            files_processed: 0,
            chunks_processed: 0,
            bytes_processed: 0,
            bytes_deduplicated: 0,
            metastore_degraded: false,
            open_files: HashMap::new(),
            completed: Vec::new(),
        }
    }

    /// Appends a segment to its file's buffer, returning the bytes buffered so far.
    ///
    /// Segments are applied in arrival order; an offset that does not match
    /// the buffered length is logged and otherwise ignored.
    pub fn append_segment(&mut self, segment: &FileSegment) -> u64 {
        let file = self.open_files.entry(segment.file_path.clone()).or_default();
        if segment.offset != file.data.len() as u64 {
            warn!(
                job_id = %self.job_id,
                file_path = %segment.file_path,
                expected = file.data.len(),
                offset = segment.offset,
                "segment offset does not match buffered length"
            );
        }
        file.declared_size = segment.file_size;
        file.data.extend_from_slice(&segment.data);
        file.data.len() as u64
    }

    /// Removes a file's buffer, returning its contents and declared size.
    pub fn take_file(&mut self, file_path: &str) -> Option<(Bytes, u64)> {
        self.open_files
            .remove(file_path)
            .map(|file| (file.data.freeze(), file.declared_size))
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }

    pub fn record_file(&mut self, manifest: FileManifest) {
        self.completed.push(manifest);
    }

    pub fn completed_files(&self) -> &[FileManifest] {
        &self.completed
    }

    pub fn status_update(&self, current_file: Option<String>, message: String) -> BackupStatus {
        BackupStatus {
            job_id: self.job_id.clone(),
            current_file,
            message,
            bytes_processed: self.bytes_processed,
            bytes_deduplicated: self.bytes_deduplicated,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            client_id: self.client_id.clone(),
            start_time: self.start_time,
            status: self.status.clone(),
            files_processed: self.files_processed,
            chunks_processed: self.chunks_processed,
            bytes_processed: self.bytes_processed,
            bytes_deduplicated: self.bytes_deduplicated,
        }
    }

    pub fn job_record(&self, start: &StartBackup) -> BackupJob {
        BackupJob {
            job_id: self.job_id.clone(),
            client_id: self.client_id.clone(),
            backup_policy_id: self.policy_id.clone(),
            start_time: self.start_time,
            end_time: None,
            status: self.status.clone(),
            source_type: start.source_type.clone(),
            source_details: start.source_details.clone(),
            files_metadata: Vec::new(),
        }
    }
}

/// Point-in-time view of a backup job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub client_id: String,
    pub start_time: DateTime<Utc>,
    pub status: String,
    pub files_processed: u64,
    pub chunks_processed: u64,
    pub bytes_processed: u64,
    pub bytes_deduplicated: u64,
}

/// Jobs seen by this process, keyed by job id. Shared by all streams.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    jobs: RwLock<HashMap<String, JobSnapshot>>,
}

impl SessionRegistry {
    /// Registers a new job unless a job with the same id is still initiated.
    pub fn try_register(&self, snapshot: JobSnapshot) -> bool {
        let mut jobs = write_unpoisoned(&self.jobs, "sessions.jobs");
        if jobs
            .get(&snapshot.job_id)
            .is_some_and(|job| job.status == STATUS_INITIATED)
        {
            return false;
        }
        jobs.insert(snapshot.job_id.clone(), snapshot);
        true
    }

    pub fn update(&self, snapshot: JobSnapshot) {
        write_unpoisoned(&self.jobs, "sessions.jobs").insert(snapshot.job_id.clone(), snapshot);
    }

    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        read_unpoisoned(&self.jobs, "sessions.jobs").get(job_id).cloned()
    }

    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        let mut active: Vec<_> = read_unpoisoned(&self.jobs, "sessions.jobs")
            .values()
            .filter(|job| job.status == STATUS_INITIATED)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        active
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.jobs, "sessions.jobs").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(job_id: &str) -> StartBackup {
        StartBackup {
            client_id: "c1".into(),
            job_id: job_id.into(),
            policy_id: "default-policy".into(),
            timestamp: 1_700_000_000,
            source_type: "filesystem".into(),
            source_details: "{}".into(),
        }
    }

    fn segment(path: &str, data: &'static [u8], offset: u64) -> FileSegment {
        FileSegment {
            file_path: path.into(),
            file_size: 11,
            data: Bytes::from_static(data),
            offset,
            is_last_segment: false,
        }
    }

    #[test]
    fn segments_accumulate_per_file() {
        let mut session = BackupSession::new(&start("b1"));
        assert_eq!(session.start_time.timestamp(), 1_700_000_000);

        assert_eq!(session.append_segment(&segment("a", b"hello ", 0)), 6);
        assert_eq!(session.append_segment(&segment("b", b"other", 0)), 5);
        assert_eq!(session.append_segment(&segment("a", b"world", 6)), 11);
        assert_eq!(session.open_file_count(), 2);

        let (data, size) = session.take_file("a").unwrap();
        assert_eq!(data, Bytes::from_static(b"hello world"));
        assert_eq!(size, 11);
        assert_eq!(session.open_file_count(), 1);
        assert!(session.take_file("a").is_none());
    }

    #[test]
    fn mismatched_offset_still_appends() {
        let mut session = BackupSession::new(&start("b1"));
        session.append_segment(&segment("a", b"abc", 0));
        assert_eq!(session.append_segment(&segment("a", b"def", 100)), 6);
    }

    #[test]
    fn zero_timestamp_uses_current_time() {
        let mut event = start("b1");
        event.timestamp = 0;
        let before = Utc::now();
        let session = BackupSession::new(&event);
        assert!(session.start_time >= before);
    }

    #[test]
    fn registry_rejects_duplicate_active_jobs() {
        let registry = SessionRegistry::default();
        let session = BackupSession::new(&start("b1"));

        assert!(registry.try_register(session.snapshot()));
        assert!(!registry.try_register(session.snapshot()));
        assert_eq!(registry.active_jobs().len(), 1);

        let mut done = session.snapshot();
        done.status = "COMPLETED".into();
        registry.update(done);
        assert!(registry.active_jobs().is_empty());
        assert_eq!(registry.get("b1").unwrap().status, "COMPLETED");

        // A finished job id may be reused.
        assert!(registry.try_register(session.snapshot()));
        assert_eq!(registry.len(), 1);
    }
}
