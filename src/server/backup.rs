use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::TryStreamExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use super::error::ServerError;
use crate::ingest::{run_session, Ingestor};
use crate::protocol::{decode_frames, encode_frame, BackupRequest};
use crate::session::JobSnapshot;

/// Status updates buffered per stream before the session waits on the client.
const RESPONSE_BUFFER: usize = 32;

/// `POST /backup`: one backup session over a framed, bidirectional body.
///
/// Requests are decoded as they arrive and responses are streamed back
/// while the upload is still in flight.
pub async fn stream_backup(State(ingestor): State<Arc<Ingestor>>, body: Body) -> Response {
    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let requests = decode_frames::<BackupRequest, _>(reader);

    let (tx, mut rx) = mpsc::channel(RESPONSE_BUFFER);
    tokio::spawn(run_session(ingestor, requests, tx));

    let frames = async_stream::stream! {
        while let Some(response) = rx.recv().await {
            match encode_frame(&response) {
                Ok(frame) => yield Ok::<_, std::io::Error>(frame),
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode backup response");
                    break;
                }
            }
        }
    };

    ([(CONTENT_TYPE, "application/octet-stream")], Body::from_stream(frames)).into_response()
}

pub async fn get_job(
    State(ingestor): State<Arc<Ingestor>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ServerError> {
    ingestor
        .sessions()
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("backup job '{job_id}'")))
}

pub async fn list_active_jobs(State(ingestor): State<Arc<Ingestor>>) -> Json<Vec<JobSnapshot>> {
    Json(ingestor.sessions().active_jobs())
}
