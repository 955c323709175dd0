use std::pin::pin;

use bytes::Bytes;
use fastcdc::v2020::{AsyncStreamCDC, FastCDC};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ChunkError;

/// Byte patterns that end a chunk once `min_size` bytes have been consumed.
const BOUNDARY_MARKERS: [[u8; 4]; 3] = [[0x00; 4], [0xFF; 4], [b'\n'; 4]];

// Bounds enforced by `fastcdc::v2020`, which asserts on them.
const FASTCDC_MIN: (usize, usize) = (64, 1_048_576);
const FASTCDC_AVG: (usize, usize) = (256, 4_194_304);
const FASTCDC_MAX: (usize, usize) = (1024, 16_777_216);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ChunkingStrategy {
    /// Cut after a run of four `0x00`, `0xFF` or `\n` bytes, or at `max_size`.
    #[default]
    Marker,
    /// Gear-hash based FastCDC, which also honours `avg_size`.
    #[value(name = "fastcdc")]
    FastCdc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub strategy: ChunkingStrategy,
    pub min_size: usize,
    /// Only used by [`ChunkingStrategy::FastCdc`].
    pub avg_size: usize,
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Marker,
            min_size: 64,
            avg_size: 2048,
            max_size: 8192,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.min_size == 0 {
            return Err(ChunkError::InvalidConfig("min_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(ChunkError::InvalidConfig(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.strategy == ChunkingStrategy::FastCdc {
            let in_range = |value: usize, (lo, hi): (usize, usize)| (lo..=hi).contains(&value);
            if !in_range(self.min_size, FASTCDC_MIN)
                || !in_range(self.avg_size, FASTCDC_AVG)
                || !in_range(self.max_size, FASTCDC_MAX)
                || self.avg_size < self.min_size
                || self.avg_size > self.max_size
            {
                return Err(ChunkError::InvalidConfig(format!(
                    "fastcdc sizes out of range: min={} avg={} max={}",
                    self.min_size, self.avg_size, self.max_size
                )));
            }
        }
        Ok(())
    }
}

/// A content-addressed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub fingerprint: String,
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    fn new(data: Bytes, offset: u64) -> Self {
        Self {
            fingerprint: fingerprint(&data),
            size: data.len() as u64,
            offset,
            data,
        }
    }
}

/// Lowercase hex BLAKE3-256 of exactly `data`.
///
/// Every call hashes with a fresh hasher, so no state leaks between chunks.
pub fn fingerprint(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    base16ct::lower::encode_string(hash.as_bytes())
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Splits `data` into chunks that cover it without gaps or overlaps.
    pub fn chunk(&self, data: impl Into<Bytes>) -> Vec<Chunk> {
        let data = data.into();
        self.cut_points(&data)
            .into_iter()
            .map(|(offset, len)| Chunk::new(data.slice(offset..offset + len), offset as u64))
            .collect()
    }

    /// Returns `(offset, length)` pairs for every chunk in `data`.
    fn cut_points(&self, data: &[u8]) -> Vec<(usize, usize)> {
        let ChunkerConfig {
            strategy,
            min_size,
            avg_size,
            max_size,
        } = self.config;

        match strategy {
            ChunkingStrategy::Marker => {
                let mut points = vec![];
                let mut offset = 0;
                while offset < data.len() {
                    let len = marker_boundary(&data[offset..], min_size, max_size);
                    points.push((offset, len));
                    offset += len;
                }
                points
            }
            ChunkingStrategy::FastCdc => {
                FastCDC::new(data, min_size as u32, avg_size as u32, max_size as u32)
                    .map(|chunk| (chunk.offset, chunk.length))
                    .collect()
            }
        }
    }

    /// Chunks a whole file read from `reader`.
    ///
    /// The marker strategy reads blocks of exactly `max_size` bytes (short only at EOF)
    /// and chunks each block on its own, so no chunk ever spans two blocks.
    pub fn chunk_reader<R>(&self, reader: R) -> impl Stream<Item = Result<Chunk, ChunkError>>
    where
        R: AsyncRead + Unpin,
    {
        let chunker = self.clone();
        async_stream::try_stream! {
            let ChunkerConfig { strategy, min_size, avg_size, max_size } = chunker.config;
            let mut reader = reader;

            match strategy {
                ChunkingStrategy::Marker => {
                    let mut consumed = 0u64;
                    loop {
                        let mut block = Vec::with_capacity(max_size);
                        let read = (&mut reader).take(max_size as u64).read_to_end(&mut block).await?;
                        if read == 0 {
                            break;
                        }
                        for mut chunk in chunker.chunk(block) {
                            chunk.offset += consumed;
                            yield chunk;
                        }
                        consumed += read as u64;
                    }
                }
                ChunkingStrategy::FastCdc => {
                    let mut chunks = AsyncStreamCDC::new(
                        reader,
                        min_size as u32,
                        avg_size as u32,
                        max_size as u32,
                    );
                    let mut chunks = pin!(chunks.as_stream());

                    while let Some(chunk) = chunks.next().await {
                        let chunk = chunk?;
                        yield Chunk::new(Bytes::from(chunk.data), chunk.offset);
                    }
                }
            }
        }
    }
}

/// Length of the next chunk at the start of `data`.
fn marker_boundary(data: &[u8], min_size: usize, max_size: usize) -> usize {
    if data.len() < min_size {
        return data.len();
    }
    let limit = max_size.min(data.len());
    (min_size..limit)
        .find(|&end| ends_with_marker(&data[..end]))
        .unwrap_or(limit)
}

fn ends_with_marker(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && BOUNDARY_MARKERS.iter().any(|marker| prefix.ends_with(marker))
}
