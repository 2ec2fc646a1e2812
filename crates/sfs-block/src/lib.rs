#![deny(unsafe_code)]
//! Block layer: image mapping, decompression, worker pool and the
//! block cache.
//!
//! The serving path is `BlockCache::get` → worker pool decode →
//! `ImageSource` → `ImageMap`. Decompressed blocks are immutable
//! buffers shared by reference count; the cache enforces single-flight
//! loads and an LRU byte budget with optional background tidying.

mod cache;
mod decode;
mod image;
mod pool;

pub use cache::{
    BlockCache, BlockFuture, BlockHandle, CacheOptions, CacheStats, ResidencyProbe,
    LATENCY_BUCKETS,
};
pub use decode::decode_block;
pub use image::{ImageMap, ImageMapOptions};
pub use pool::{CancelFlag, JobPriority, WorkerPool, WorkerPoolConfig};

use sfs_error::Result;
use sfs_types::BlockId;
use std::sync::Arc;

/// Immutable decompressed block buffer.
///
/// Cheap to clone; all readers share one allocation. Buffers are
/// created by a decode and freed when the last handle and the cache
/// entry are gone.
#[derive(Debug, Clone)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for BlockBuf {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.as_slice() == other.bytes.as_slice()
    }
}

impl Eq for BlockBuf {}

/// Source of decompressed blocks.
///
/// The production implementation is [`ImageSource`]; tests wrap it to
/// count or fail loads. Implementations must be reentrant — the pool
/// calls `load` concurrently from worker threads.
pub trait BlockSource: Send + Sync {
    /// Number of blocks addressable in this source.
    fn num_blocks(&self) -> u32;

    /// Decompressed size of a full block.
    fn block_size(&self) -> u32;

    /// Decompressed size of `block` (the final block may be short).
    fn decompressed_len(&self, block: BlockId) -> u64;

    /// Materialize the decompressed bytes of `block`.
    ///
    /// `cancel` is polled by long-running decodes of background loads;
    /// foreground loads pass a flag that is never set.
    fn load(&self, block: BlockId, cancel: &CancelFlag) -> Result<BlockBuf>;
}

/// `BlockSource` over a mapped image: block index lookup plus codec
/// decode.
pub struct ImageSource {
    map: Arc<ImageMap>,
    decompress_ratio: f64,
}

impl ImageSource {
    #[must_use]
    pub fn new(map: Arc<ImageMap>, decompress_ratio: f64) -> Self {
        Self {
            map,
            decompress_ratio,
        }
    }

    #[must_use]
    pub fn map(&self) -> &Arc<ImageMap> {
        &self.map
    }
}

impl BlockSource for ImageSource {
    fn num_blocks(&self) -> u32 {
        self.map.header().num_blocks()
    }

    fn block_size(&self) -> u32 {
        self.map.header().block_size.block_size()
    }

    fn decompressed_len(&self, block: BlockId) -> u64 {
        self.map.header().decompressed_len(block)
    }

    fn load(&self, block: BlockId, cancel: &CancelFlag) -> Result<BlockBuf> {
        let (compressed, codec_raw) = self.map.compressed_block(block)?;
        let expected = usize::try_from(self.decompressed_len(block))
            .map_err(|_| sfs_error::SfsError::InvalidArgument("block size exceeds usize"))?;
        let bytes = decode::decode_block(
            compressed,
            codec_raw,
            expected,
            block,
            self.decompress_ratio,
            cancel,
        )?;
        Ok(BlockBuf::new(bytes))
    }
}
