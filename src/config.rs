//! Command-line configuration for the ingest and storage node binaries.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::chunker::{ChunkerConfig, ChunkingStrategy};

#[derive(Debug, Parser)]
#[command(name = "dedupe-engine", version, about = "Deduplicating backup engine")]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an ingest node accepting backup streams
    Ingest(IngestArgs),
    /// Run a storage node serving chunk bytes
    Storage(StorageArgs),
}

/// Where chunk bytes are kept on local disk.
#[derive(Debug, Args)]
pub struct BlobStoreArgs {
    /// Root directory of the object store
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Bucket (subdirectory) chunks are written to
    #[arg(long, env = "BUCKET", default_value = "dedupe-chunks")]
    pub bucket: String,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Address to listen on
    #[arg(long, env = "INGEST_LISTEN", default_value = "0.0.0.0:50051")]
    pub listen: String,

    /// Identifier reported for chunks stored by the embedded storage node
    #[arg(long, env = "NODE_ID", default_value = "ingest-node-1")]
    pub node_id: String,

    /// Base URL of a storage node. Without it, chunks go to an embedded store.
    #[arg(long, env = "STORAGE_NODE_ADDR")]
    pub storage_node_url: Option<String>,

    /// Metadata database directory. Without it, deduplication is cache-only.
    #[arg(long, env = "METADATA_PATH")]
    pub metadata_path: Option<PathBuf>,

    #[command(flatten)]
    pub blobs: BlobStoreArgs,

    /// Chunk boundary strategy
    #[arg(long, env = "CHUNKING", value_enum, default_value_t = ChunkingStrategy::Marker)]
    pub chunking: ChunkingStrategy,

    #[arg(long, default_value_t = 64)]
    pub min_chunk_size: usize,

    /// Target chunk size (fastcdc only)
    #[arg(long, default_value_t = 2048)]
    pub avg_chunk_size: usize,

    #[arg(long, default_value_t = 8192)]
    pub max_chunk_size: usize,

    /// Entries kept in the in-memory dedup cache
    #[arg(long, env = "CACHE_CAPACITY", default_value_t = 1000, value_parser = parse_min_one)]
    pub cache_capacity: usize,

    /// Fingerprints the membership filter is sized for
    #[arg(long, env = "FILTER_CAPACITY", default_value_t = 10_000, value_parser = parse_min_one)]
    pub filter_capacity: usize,
}

impl IngestArgs {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            strategy: self.chunking,
            min_size: self.min_chunk_size,
            avg_size: self.avg_chunk_size,
            max_size: self.max_chunk_size,
        }
    }
}

#[derive(Debug, Args)]
pub struct StorageArgs {
    /// Address to listen on
    #[arg(long, env = "STORAGE_LISTEN", default_value = "0.0.0.0:50052")]
    pub listen: String,

    /// Identifier returned with every stored chunk
    #[arg(long, env = "NODE_ID", default_value = "data-storage-node-1")]
    pub node_id: String,

    #[command(flatten)]
    pub blobs: BlobStoreArgs,
}

fn parse_min_one(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|e| format!("{e}"))?;
    if n == 0 {
        return Err("value must be at least 1".into());
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_defaults() {
        let cli = Cli::try_parse_from(["dedupe-engine", "ingest"]).unwrap();
        let Command::Ingest(args) = cli.command else {
            panic!("expected the ingest subcommand");
        };
        assert_eq!(args.listen, "0.0.0.0:50051");
        assert_eq!(args.blobs.bucket, "dedupe-chunks");
        assert_eq!(args.cache_capacity, 1000);
        assert_eq!(args.filter_capacity, 10_000);
        assert_eq!(args.chunker_config(), ChunkerConfig::default());
    }

    #[test]
    fn storage_flags() {
        let cli = Cli::try_parse_from([
            "dedupe-engine",
            "--log-format",
            "json",
            "storage",
            "--listen",
            "127.0.0.1:9000",
            "--node-id",
            "node-7",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Storage(args) = cli.command else {
            panic!("expected the storage subcommand");
        };
        assert_eq!(args.listen, "127.0.0.1:9000");
        assert_eq!(args.node_id, "node-7");
    }

    #[test]
    fn fastcdc_strategy_and_zero_capacity() {
        let cli = Cli::try_parse_from(["dedupe-engine", "ingest", "--chunking", "fastcdc"]).unwrap();
        let Command::Ingest(args) = cli.command else {
            panic!("expected the ingest subcommand");
        };
        assert_eq!(args.chunking, ChunkingStrategy::FastCdc);

        assert!(Cli::try_parse_from(["dedupe-engine", "ingest", "--cache-capacity", "0"]).is_err());
    }
}
