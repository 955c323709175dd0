//! Messages of the streaming backup protocol.
//!
//! Each message travels as one frame: a 4-byte big-endian length followed by
//! the postcard encoding of a [`BackupRequest`] or [`BackupResponse`].

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::codec::{Encoder, FramedRead, LengthDelimitedCodec};

use crate::error::IngestError;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBackup {
    pub client_id: String,
    pub job_id: String,
    pub policy_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub source_type: String,
    pub source_details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSegment {
    pub file_path: String,
    pub file_size: u64,
    pub data: Bytes,
    pub offset: u64,
    pub is_last_segment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndBackup {
    pub job_id: String,
    pub status: String,
    pub summary: String,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupRequest {
    StartBackup(StartBackup),
    FileSegment(FileSegment),
    EndBackup(EndBackup),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub job_id: String,
    pub current_file: Option<String>,
    pub message: String,
    pub bytes_processed: u64,
    pub bytes_deduplicated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_code: ErrorCode,
    pub error_message: String,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupResponse {
    StatusUpdate(BackupStatus),
    ErrorMessage(ErrorMessage),
}

impl From<&IngestError> for BackupResponse {
    fn from(err: &IngestError) -> Self {
        Self::ErrorMessage(ErrorMessage {
            error_code: err.code(),
            error_message: err.to_string(),
        })
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Encodes one message as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, IngestError> {
    let payload = postcard::to_stdvec(message).map_err(|err| IngestError::Protocol(err.to_string()))?;
    let mut frame = BytesMut::with_capacity(payload.len() + 4);
    codec()
        .encode(Bytes::from(payload), &mut frame)
        .map_err(|err| IngestError::Protocol(err.to_string()))?;
    Ok(frame.freeze())
}

/// Decodes a byte stream into the messages it carries, in order.
pub fn decode_frames<T, R>(reader: R) -> impl Stream<Item = Result<T, IngestError>>
where
    T: DeserializeOwned,
    R: AsyncRead,
{
    FramedRead::new(reader, codec()).map(|frame| {
        let frame = frame.map_err(|err| IngestError::Protocol(err.to_string()))?;
        postcard::from_bytes(&frame).map_err(|err| IngestError::Protocol(err.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn frames_decode_in_order() {
        let requests = vec![
            BackupRequest::StartBackup(StartBackup {
                client_id: "c1".into(),
                job_id: "b1".into(),
                policy_id: "default-policy".into(),
                timestamp: 1_700_000_000,
                source_type: "filesystem".into(),
                source_details: "{}".into(),
            }),
            BackupRequest::FileSegment(FileSegment {
                file_path: "f.txt".into(),
                file_size: 11,
                data: Bytes::from_static(b"hello world"),
                offset: 0,
                is_last_segment: true,
            }),
        ];

        let mut wire = Vec::new();
        for request in &requests {
            wire.extend_from_slice(&encode_frame(request).unwrap());
        }

        let decoded: Vec<BackupRequest> = decode_frames(&wire[..]).try_collect().await.unwrap();
        assert_eq!(decoded, requests);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_protocol_error() {
        let frame = encode_frame(&BackupRequest::EndBackup(EndBackup {
            job_id: "b1".into(),
            status: "COMPLETED".into(),
            summary: String::new(),
        }))
        .unwrap();

        let mut frames = Box::pin(decode_frames::<BackupRequest, _>(&frame[..frame.len() - 1]));
        assert!(matches!(
            frames.next().await,
            Some(Err(IngestError::Protocol(_)))
        ));
    }

    #[test]
    fn errors_map_to_codes() {
        let err = IngestError::FailedPrecondition("no active backup job".into());
        let BackupResponse::ErrorMessage(message) = BackupResponse::from(&err) else {
            panic!("expected an error message");
        };
        assert_eq!(message.error_code, ErrorCode::FailedPrecondition);
        assert_eq!(message.error_message, "no active backup job");
    }
}
