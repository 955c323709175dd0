use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dedupe_engine::backend::{ChunkStore, RemoteStorageNode};
use dedupe_engine::blobstore::FsBlobStore;
use dedupe_engine::chunker::Chunker;
use dedupe_engine::config::{Cli, Command, IngestArgs, StorageArgs};
use dedupe_engine::index::DedupIndex;
use dedupe_engine::ingest::Ingestor;
use dedupe_engine::logging::init_logging;
use dedupe_engine::metastore::FjallMetaStore;
use dedupe_engine::server;
use dedupe_engine::session::SessionRegistry;
use dedupe_engine::storage_node::StorageNode;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Command::Ingest(args) => run_ingest(args).await,
        Command::Storage(args) => run_storage(args).await,
    }
}

async fn run_ingest(args: IngestArgs) -> anyhow::Result<()> {
    let chunker = Chunker::new(args.chunker_config()).context("invalid chunking options")?;

    let chunk_store: Arc<dyn ChunkStore> = match &args.storage_node_url {
        Some(url) => {
            info!(url = %url, "storing chunks on remote storage node");
            Arc::new(RemoteStorageNode::new(url).context("cannot create storage node client")?)
        }
        None => {
            let blobs = FsBlobStore::open(&args.blobs.data_dir, &args.blobs.bucket).with_context(|| {
                format!("cannot open object store under '{}'", args.blobs.data_dir.display())
            })?;
            info!(root = %blobs.root().display(), "storing chunks in embedded object store");
            Arc::new(StorageNode::new(args.node_id.clone(), Arc::new(blobs)))
        }
    };

    let index = Arc::new(DedupIndex::new(args.cache_capacity, args.filter_capacity));
    let mut ingestor = Ingestor::new(chunker, index, chunk_store, Arc::new(SessionRegistry::default()));

    match &args.metadata_path {
        Some(path) => match FjallMetaStore::open(path) {
            Ok(metastore) => {
                info!(path = %path.display(), "opened metadata store");
                ingestor = ingestor.with_metastore(Arc::new(metastore));
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "metadata store unavailable; deduplicating from cache only");
            }
        },
        None => info!("no metadata store configured; deduplicating from cache only"),
    }

    let app = server::ingest_router(Arc::new(ingestor));
    serve(&args.listen, app, "ingest node").await
}

async fn run_storage(args: StorageArgs) -> anyhow::Result<()> {
    let blobs = FsBlobStore::open(&args.blobs.data_dir, &args.blobs.bucket).with_context(|| {
        format!("cannot open object store under '{}'", args.blobs.data_dir.display())
    })?;
    info!(node_id = %args.node_id, root = %blobs.root().display(), "opened object store");

    let node = StorageNode::new(args.node_id, Arc::new(blobs));
    let app = server::storage_router(Arc::new(node));
    serve(&args.listen, app, "storage node").await
}

async fn serve(listen: &str, app: axum::Router, role: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot bind to {listen}"))?;
    info!("{role} listening on {listen}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("{role} stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
