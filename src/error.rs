use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunker configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error while chunking: {0}")]
    Io(#[from] std::io::Error),

    #[error("content-defined chunking failed: {0}")]
    Cdc(#[from] fastcdc::v2020::Error),
}

/// Errors of the object store and of the chunk store calls built on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage node request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage node rejected the request: {0}")]
    Remote(String),
}

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("metadata store error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("metadata record encoding error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("conflicting concurrent write to the metadata store")]
    Conflict,

    #[error("backup job not found: '{0}'")]
    JobNotFound(String),

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of one backup session. Every variant ends the stream it occurred on.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("failed to store chunk {fingerprint}: {source}")]
    Storage {
        fingerprint: String,
        #[source]
        source: StoreError,
    },

    #[error("malformed request frame: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::InvalidArgument(_) | Self::Protocol(_) => ErrorCode::InvalidArgument,
            Self::Storage { .. } | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}
