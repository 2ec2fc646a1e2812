#![forbid(unsafe_code)]
//! Inode read path.
//!
//! Translates `(inode, offset, length)` into chunk walks over the
//! block cache and assembles scatter-gather replies that pin the
//! underlying buffers until the caller is done with them. A per-open
//! sequential-access detector promotes spatially-local reads into
//! readahead prefetches.

use parking_lot::Mutex;
use sfs_block::{BlockCache, BlockHandle, JobPriority};
use sfs_error::Result;
use sfs_metadata::Chunk;
use sfs_types::{BlockId, InodeNum};
use std::sync::Arc;
use tracing::trace;

/// Read-path tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Readahead budget in bytes; 0 disables prefetching.
    pub readahead_bytes: u64,
    /// Consecutive sequential reads required before readahead fires;
    /// 0 disables the detector.
    pub seq_detector_threshold: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            readahead_bytes: 0,
            seq_detector_threshold: 4,
        }
    }
}

/// Chunk list of one open file with cumulative start offsets, so a
/// read can binary-search the chunk containing its start offset.
#[derive(Debug, Clone)]
pub struct FileMap {
    chunks: Vec<Chunk>,
    starts: Vec<u64>,
    size: u64,
}

impl FileMap {
    #[must_use]
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let mut starts = Vec::with_capacity(chunks.len());
        let mut pos = 0_u64;
        for chunk in &chunks {
            starts.push(pos);
            pos += u64::from(chunk.len);
        }
        Self {
            chunks,
            starts,
            size: pos,
        }
    }

    /// Total byte length covered by the chunk list.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Index of the chunk containing `offset`.
    fn locate(&self, offset: u64) -> Option<usize> {
        if offset >= self.size {
            return None;
        }
        Some(self.starts.partition_point(|start| *start <= offset) - 1)
    }
}

/// Classifies the read pattern of one open file.
///
/// Counts runs of adjacent-or-overlapping forward reads; once the run
/// reaches the threshold, every further sequential read reports
/// readahead. Any non-sequential read restarts the run.
#[derive(Debug)]
pub struct SeqAccessDetector {
    threshold: usize,
    last_end: u64,
    run: usize,
}

impl SeqAccessDetector {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last_end: 0,
            run: 0,
        }
    }

    /// Record a read; returns true when readahead should fire.
    pub fn record(&mut self, offset: u64, len: u64) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let sequential = offset <= self.last_end && offset + len >= self.last_end;
        self.run = if sequential { self.run + 1 } else { 1 };
        self.last_end = offset + len;
        self.run >= self.threshold
    }
}

/// One scatter-gather segment: a span of a pinned block buffer.
#[derive(Debug, Clone)]
pub struct ReadSegment {
    handle: BlockHandle,
    offset: usize,
    len: usize,
}

impl ReadSegment {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.handle.data()[self.offset..self.offset + self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Scatter-gather read result.
///
/// Holds the cache handles of every block it references; the blocks
/// stay pinned until the reply is dropped.
#[derive(Debug, Default)]
pub struct ReadReply {
    segments: Vec<ReadSegment>,
    len: usize,
}

impl ReadReply {
    /// Bytes available (may be shorter than requested at EOF).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn segments(&self) -> &[ReadSegment] {
        &self.segments
    }

    /// Flatten into one contiguous buffer. Driver adapters whose reply
    /// API takes a single buffer copy here, at the outermost edge.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment.data());
        }
        out
    }

    fn push(&mut self, handle: BlockHandle, offset: usize, len: usize) {
        self.len += len;
        self.segments.push(ReadSegment {
            handle,
            offset,
            len,
        });
    }
}

/// Per-open-file state: the chunk map plus the access detector.
#[derive(Debug)]
pub struct OpenFile {
    ino: InodeNum,
    map: FileMap,
    detector: Mutex<SeqAccessDetector>,
}

impl OpenFile {
    #[must_use]
    pub fn ino(&self) -> InodeNum {
        self.ino
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.map.size()
    }
}

/// Executes reads against the block cache.
pub struct InodeReader {
    cache: Arc<BlockCache>,
    options: ReaderOptions,
}

impl InodeReader {
    #[must_use]
    pub fn new(cache: Arc<BlockCache>, options: ReaderOptions) -> Self {
        Self { cache, options }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Build the per-open state for a file from its chunk list.
    #[must_use]
    pub fn open(&self, ino: InodeNum, chunks: Vec<Chunk>) -> OpenFile {
        OpenFile {
            ino,
            map: FileMap::new(chunks),
            detector: Mutex::new(SeqAccessDetector::new(self.options.seq_detector_threshold)),
        }
    }

    /// Read `len` bytes at `offset`.
    ///
    /// Walks the chunks covering the range, requests each distinct
    /// block from the cache exactly once (reusing the handle across
    /// chunks of the same block) and assembles the reply. Short at
    /// EOF; empty beyond it.
    pub fn read(&self, file: &OpenFile, offset: u64, len: u32) -> Result<ReadReply> {
        let mut reply = ReadReply::default();
        let end = offset.saturating_add(u64::from(len)).min(file.map.size());
        if offset >= end {
            return Ok(reply);
        }

        let Some(first_chunk) = file.map.locate(offset) else {
            return Ok(reply);
        };

        let mut pos = offset;
        let mut index = first_chunk;
        let mut current: Option<BlockHandle> = None;
        while pos < end && index < file.map.chunks.len() {
            let chunk = file.map.chunks[index];
            let chunk_start = file.map.starts[index];
            let skip = pos - chunk_start;
            let take = (u64::from(chunk.len) - skip).min(end - pos);

            let handle = match &current {
                Some(handle) if handle.block() == chunk.block => handle.clone(),
                _ => {
                    let handle = self.cache.get(chunk.block, JobPriority::Foreground)?;
                    current = Some(handle.clone());
                    handle
                }
            };

            #[allow(clippy::cast_possible_truncation)]
            reply.push(
                handle,
                (u64::from(chunk.offset) + skip) as usize,
                take as usize,
            );
            pos += take;
            index += 1;
        }

        trace!(
            target: "sfs::reader",
            event = "read_assembled",
            ino = file.ino.0,
            offset,
            requested = len,
            returned = reply.len(),
            segments = reply.segments().len()
        );

        self.maybe_readahead(file, offset, end, index);
        Ok(reply)
    }

    /// Feed the detector and enqueue prefetches when it fires.
    fn maybe_readahead(&self, file: &OpenFile, offset: u64, end: u64, next_chunk: usize) {
        if self.options.readahead_bytes == 0 || self.options.seq_detector_threshold == 0 {
            return;
        }
        let fired = file.detector.lock().record(offset, end - offset);
        if !fired {
            return;
        }

        let budget_blocks = self.options.readahead_bytes / u64::from(self.cache.block_size());
        if budget_blocks == 0 {
            return;
        }

        // Next distinct blocks the file will touch, per its chunk list.
        let mut targets: Vec<BlockId> = Vec::new();
        for chunk in &file.map.chunks[next_chunk.min(file.map.chunks.len())..] {
            if targets.last() != Some(&chunk.block) {
                targets.push(chunk.block);
                if targets.len() as u64 >= budget_blocks {
                    break;
                }
            }
        }

        for block in targets {
            trace!(
                target: "sfs::reader",
                event = "readahead",
                ino = file.ino.0,
                block = block.0
            );
            self.cache.prefetch(block);
        }
    }
}
