pub mod backend;
pub mod blobstore;
pub mod chunker;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod metastore;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage_node;
mod sync;
