use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;

use super::error::ServerError;
use crate::backend::{StoreChunkResponse, CHUNK_SIZE_HEADER};
use crate::error::StoreError;
use crate::storage_node::StorageNode;

pub async fn put_chunk(
    State(node): State<Arc<StorageNode>>,
    Path(fingerprint): Path<String>,
    body: Bytes,
) -> Result<Response, ServerError> {
    match node.store(&fingerprint, body).await {
        Ok(stored) => Ok(Json(StoreChunkResponse {
            storage_location: stored.storage_location,
            storage_node_id: stored.storage_node_id,
            success: true,
            error_message: String::new(),
        })
        .into_response()),
        Err(StoreError::InvalidArgument(msg)) => Err(ServerError::BadRequest(msg)),
        Err(err) => {
            tracing::error!(fingerprint = %fingerprint, error = %err, "chunk upload failed");
            let failed = StoreChunkResponse {
                storage_location: String::new(),
                storage_node_id: node.node_id().to_owned(),
                success: false,
                error_message: err.to_string(),
            };
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(failed)).into_response())
        }
    }
}

pub async fn get_chunk(
    State(node): State<Arc<StorageNode>>,
    Path(fingerprint): Path<String>,
) -> Result<Response, ServerError> {
    let Some(chunk) = node.fetch(&fingerprint).await? else {
        return Err(ServerError::NotFound(format!("chunk {fingerprint} not found")));
    };

    let headers = [
        (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
        (HeaderName::from_static(CHUNK_SIZE_HEADER), HeaderValue::from(chunk.size)),
    ];
    Ok((headers, chunk.data).into_response())
}

/// `/chunks/` with nothing after the slash.
pub async fn missing_fingerprint() -> ServerError {
    ServerError::BadRequest("fingerprint is required".into())
}
