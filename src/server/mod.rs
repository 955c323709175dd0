//! HTTP surfaces of the ingest node and the storage node.

pub mod backup;
pub mod chunks;
pub mod error;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub use error::ServerError;

use crate::ingest::Ingestor;
use crate::protocol::MAX_FRAME_LEN;
use crate::storage_node::StorageNode;

pub fn ingest_router(ingestor: Arc<Ingestor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backup", post(backup::stream_backup))
        .route("/jobs", get(backup::list_active_jobs))
        .route("/jobs/{job_id}", get(backup::get_job))
        .layer(TraceLayer::new_for_http())
        .with_state(ingestor)
}

pub fn storage_router(node: Arc<StorageNode>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/chunks/",
            get(chunks::missing_fingerprint).put(chunks::missing_fingerprint),
        )
        .route(
            "/chunks/{fingerprint}",
            get(chunks::get_chunk).put(chunks::put_chunk),
        )
        .layer(DefaultBodyLimit::max(MAX_FRAME_LEN))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
