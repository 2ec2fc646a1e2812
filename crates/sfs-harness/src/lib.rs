#![forbid(unsafe_code)]
//! Test harness for StrataFS.
//!
//! Provides a deterministic in-memory image builder so integration
//! tests can construct images with known contents. This is test
//! tooling, not a production writer: it favors simplicity over
//! compression quality and always emits the smallest layout that the
//! readers accept.

use sfs_ondisk::{
    SECTION_CHUNKS, SECTION_DIRENTS, SECTION_GIDS, SECTION_INODES, SECTION_MODES, SECTION_NAMES,
    SECTION_STATS, SECTION_SYMLINKS, SECTION_TARGETS, SECTION_UIDS,
};
use sfs_types::{
    BlockSizeExp, CodecTag, ParseError, FORMAT_MAJOR, IMAGE_MAGIC, SECTION_DESC_LEN, S_IFDIR,
    S_IFLNK, S_IFREG,
};
use sfs_block::{BlockBuf, BlockSource, CancelFlag};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wraps a block source and counts decoder invocations.
///
/// Property tests probe the single-flight and readahead behavior with
/// this: for any concurrent workload, `loads()` must equal the number
/// of distinct blocks actually materialized.
pub struct CountingBlockSource {
    inner: Arc<dyn BlockSource>,
    loads: AtomicU64,
}

impl CountingBlockSource {
    #[must_use]
    pub fn new(inner: Arc<dyn BlockSource>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            loads: AtomicU64::new(0),
        })
    }

    /// Number of decoder invocations so far.
    #[must_use]
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

impl BlockSource for CountingBlockSource {
    fn num_blocks(&self) -> u32 {
        self.inner.num_blocks()
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn decompressed_len(&self, block: sfs_types::BlockId) -> u64 {
        self.inner.decompressed_len(block)
    }

    fn load(
        &self,
        block: sfs_types::BlockId,
        cancel: &CancelFlag,
    ) -> sfs_error::Result<BlockBuf> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(block, cancel)
    }
}

/// Default file timestamp used by the builder (fixed for determinism).
pub const BUILD_MTIME: u64 = 1_700_000_000;

const DEFAULT_FILE_MODE: u32 = S_IFREG | 0o644;
const DEFAULT_DIR_MODE: u32 = S_IFDIR | 0o755;
const DEFAULT_LINK_MODE: u32 = S_IFLNK | 0o777;
const DEFAULT_UID: u32 = 1000;
const DEFAULT_GID: u32 = 1000;

#[derive(Debug, Clone)]
enum NodeData {
    Dir(BTreeMap<Vec<u8>, u32>),
    File(Vec<u8>),
    Symlink(Vec<u8>),
    Special,
}

#[derive(Debug, Clone)]
struct BuildInode {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
    nlink: u32,
    rdev: u32,
    data: NodeData,
}

/// Error raised while assembling a test image.
#[derive(Debug)]
pub enum BuildError {
    /// Parent directory missing or path already taken.
    BadPath(String),
    /// Value does not fit the packed encoding.
    Encoding(ParseError),
    /// Compression backend failure.
    Codec(String),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPath(path) => write!(f, "bad path: {path}"),
            Self::Encoding(err) => write!(f, "encoding: {err}"),
            Self::Codec(detail) => write!(f, "codec: {detail}"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Deterministic image builder.
///
/// Paths are absolute (`/a/b`); parent directories must exist before
/// children are added. `build()` produces a complete container byte
/// vector ready for the image map.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: BlockSizeExp,
    codec: CodecTag,
    inodes: Vec<BuildInode>,
    prelude: Vec<u8>,
}

impl ImageBuilder {
    /// Create a builder with the given block-size exponent.
    ///
    /// The root directory exists from the start.
    pub fn new(block_size_exp: u8) -> Result<Self, BuildError> {
        let block_size = BlockSizeExp::new(block_size_exp).map_err(BuildError::Encoding)?;
        Ok(Self {
            block_size,
            codec: CodecTag::None,
            inodes: vec![BuildInode {
                mode: DEFAULT_DIR_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
                mtime: BUILD_MTIME,
                nlink: 2,
                rdev: 0,
                data: NodeData::Dir(BTreeMap::new()),
            }],
            prelude: Vec::new(),
        })
    }

    /// Compress data blocks with `codec` (default: store uncompressed).
    pub fn codec(&mut self, codec: CodecTag) -> &mut Self {
        self.codec = codec;
        self
    }

    /// Prepend raw bytes before the image (shell-script prelude).
    pub fn prelude(&mut self, bytes: &[u8]) -> &mut Self {
        self.prelude = bytes.to_vec();
        self
    }

    /// Add a directory.
    pub fn dir(&mut self, path: &str) -> Result<&mut Self, BuildError> {
        let inode = BuildInode {
            mode: DEFAULT_DIR_MODE,
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
            mtime: BUILD_MTIME,
            nlink: 2,
            rdev: 0,
            data: NodeData::Dir(BTreeMap::new()),
        };
        self.attach(path, inode)?;
        // POSIX convention: a subdirectory bumps the parent's count.
        let parent = self.parent_of(path)?;
        self.inodes[parent as usize].nlink += 1;
        Ok(self)
    }

    /// Add a regular file with default ownership and mode.
    pub fn file(&mut self, path: &str, data: &[u8]) -> Result<&mut Self, BuildError> {
        self.file_with(path, data, DEFAULT_FILE_MODE, DEFAULT_UID, DEFAULT_GID)
    }

    /// Add a regular file with explicit mode and ownership.
    pub fn file_with(
        &mut self,
        path: &str,
        data: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<&mut Self, BuildError> {
        self.attach(
            path,
            BuildInode {
                mode: S_IFREG | (mode & 0o7777),
                uid,
                gid,
                mtime: BUILD_MTIME,
                nlink: 1,
                rdev: 0,
                data: NodeData::File(data.to_vec()),
            },
        )?;
        Ok(self)
    }

    /// Add a symlink.
    pub fn symlink(&mut self, path: &str, target: &str) -> Result<&mut Self, BuildError> {
        self.attach(
            path,
            BuildInode {
                mode: DEFAULT_LINK_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
                mtime: BUILD_MTIME,
                nlink: 1,
                rdev: 0,
                data: NodeData::Symlink(target.as_bytes().to_vec()),
            },
        )?;
        Ok(self)
    }

    /// Add a hardlink: a new name for an existing file inode.
    pub fn hardlink(&mut self, path: &str, existing: &str) -> Result<&mut Self, BuildError> {
        let target = self
            .resolve(existing)
            .ok_or_else(|| BuildError::BadPath(existing.to_owned()))?;
        if !matches!(self.inodes[target as usize].data, NodeData::File(_)) {
            return Err(BuildError::BadPath(existing.to_owned()));
        }
        let parent = self.parent_of(path)?;
        let name = leaf_name(path)?;
        let NodeData::Dir(entries) = &mut self.inodes[parent as usize].data else {
            return Err(BuildError::BadPath(path.to_owned()));
        };
        if entries.insert(name, target).is_some() {
            return Err(BuildError::BadPath(path.to_owned()));
        }
        self.inodes[target as usize].nlink += 1;
        Ok(self)
    }

    /// Add a device/fifo/socket node (mode carries the file type).
    pub fn special(&mut self, path: &str, mode: u32, rdev: u32) -> Result<&mut Self, BuildError> {
        self.attach(
            path,
            BuildInode {
                mode,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
                mtime: BUILD_MTIME,
                nlink: 1,
                rdev,
                data: NodeData::Special,
            },
        )?;
        Ok(self)
    }

    fn parent_of(&self, path: &str) -> Result<u32, BuildError> {
        let (parent_path, _) = split_path(path)?;
        self.resolve(&parent_path)
            .ok_or_else(|| BuildError::BadPath(path.to_owned()))
    }

    fn resolve(&self, path: &str) -> Option<u32> {
        let mut current = 0_u32;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let NodeData::Dir(entries) = &self.inodes[current as usize].data else {
                return None;
            };
            current = *entries.get(component.as_bytes())?;
        }
        Some(current)
    }

    fn attach(&mut self, path: &str, inode: BuildInode) -> Result<u32, BuildError> {
        let parent = self.parent_of(path)?;
        let name = leaf_name(path)?;
        let idx = u32::try_from(self.inodes.len())
            .map_err(|_| BuildError::BadPath(path.to_owned()))?;
        let NodeData::Dir(entries) = &mut self.inodes[parent as usize].data else {
            return Err(BuildError::BadPath(path.to_owned()));
        };
        if entries.insert(name, idx).is_some() {
            return Err(BuildError::BadPath(path.to_owned()));
        }
        self.inodes.push(inode);
        Ok(idx)
    }

    /// Assemble the container bytes.
    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let block_size = self.block_size.block_size() as usize;

        // 1. Slice concatenated file data into blocks, assigning each
        //    file its chunk run.
        let mut chunks: Vec<(u32, u32, u32)> = Vec::new(); // (block, offset, len)
        let mut chunk_ranges: Vec<(u32, u32)> = Vec::new(); // per inode: (start, count)
        let mut blocks: Vec<Vec<u8>> = Vec::new();
        let mut current = Vec::with_capacity(block_size);
        let mut orig_bytes = 0_u64;

        for inode in &self.inodes {
            let NodeData::File(data) = &inode.data else {
                chunk_ranges.push((0, 0));
                continue;
            };
            orig_bytes += data.len() as u64;
            let start = u32::try_from(chunks.len())
                .map_err(|_| BuildError::Codec("chunk table overflow".to_owned()))?;
            let mut remaining: &[u8] = data;
            while !remaining.is_empty() {
                if current.len() == block_size {
                    blocks.push(std::mem::take(&mut current));
                }
                let space = block_size - current.len();
                let take = space.min(remaining.len());
                let offset = current.len() as u32;
                current.extend_from_slice(&remaining[..take]);
                chunks.push((blocks.len() as u32, offset, take as u32));
                remaining = &remaining[take..];
            }
            let count = u32::try_from(chunks.len()).unwrap_or(u32::MAX) - start;
            chunk_ranges.push((start, count));
        }
        let last_block_len = if current.is_empty() {
            if blocks.is_empty() {
                0
            } else {
                block_size as u64
            }
        } else {
            let len = current.len() as u64;
            blocks.push(current);
            len
        };

        // 2. Compress blocks and build the block index.
        let mut block_data = Vec::new();
        let mut block_index = Vec::new();
        let data_base = sfs_types::IMAGE_HEADER_LEN as u64;
        for block in &blocks {
            let compressed = compress(self.codec, block)?;
            push_u64(&mut block_index, data_base + block_data.len() as u64);
            push_u32(
                &mut block_index,
                u32::try_from(compressed.len())
                    .map_err(|_| BuildError::Codec("compressed block too large".to_owned()))?,
            );
            block_index.push(self.codec.to_raw());
            block_index.extend_from_slice(&[0, 0, 0]);
            block_data.extend_from_slice(&compressed);
        }

        // 3. Pack the metadata section.
        let meta = self.build_metadata(&chunks, &chunk_ranges, orig_bytes, blocks.len() as u64)?;

        // 4. Header + data + index + metadata.
        let block_index_offset = data_base + block_data.len() as u64;
        let metadata_offset = block_index_offset + block_index.len() as u64;

        let mut image = Vec::new();
        image.extend_from_slice(&self.prelude);
        image.extend_from_slice(&IMAGE_MAGIC);
        push_u16(&mut image, FORMAT_MAJOR);
        push_u16(&mut image, 0);
        push_u16(&mut image, 0);
        push_u16(&mut image, 0);
        push_u32(&mut image, 0); // feature flags
        image.push(self.block_size.get());
        image.extend_from_slice(&[0, 0, 0]);
        push_u64(&mut image, metadata_offset);
        push_u64(&mut image, meta.len() as u64);
        push_u64(&mut image, block_index_offset);
        push_u64(&mut image, block_index.len() as u64);
        push_u64(&mut image, last_block_len);
        image.extend_from_slice(&block_data);
        image.extend_from_slice(&block_index);
        image.extend_from_slice(&meta);
        Ok(image)
    }

    fn build_metadata(
        &self,
        chunks: &[(u32, u32, u32)],
        chunk_ranges: &[(u32, u32)],
        orig_bytes: u64,
        block_count: u64,
    ) -> Result<Vec<u8>, BuildError> {
        // Dictionaries preserve first-seen order.
        let mut modes: Vec<u32> = Vec::new();
        let mut uids: Vec<u32> = Vec::new();
        let mut gids: Vec<u32> = Vec::new();
        let dict_index = |dict: &mut Vec<u32>, value: u32| -> Result<u16, BuildError> {
            let pos = match dict.iter().position(|v| *v == value) {
                Some(pos) => pos,
                None => {
                    dict.push(value);
                    dict.len() - 1
                }
            };
            u16::try_from(pos).map_err(|_| BuildError::Codec("dictionary overflow".to_owned()))
        };

        // Dirent table grouped per directory in inode order; names go
        // into the arena as they are first written.
        let mut names = Vec::new();
        let mut dirents = Vec::new(); // (inode, name_offset, name_len)
        let mut dirent_ranges = vec![(0_u32, 0_u32); self.inodes.len()];
        for (idx, inode) in self.inodes.iter().enumerate() {
            let NodeData::Dir(entries) = &inode.data else {
                continue;
            };
            let start = dirents.len() as u32;
            for (name, child) in entries {
                let name_offset = u32::try_from(names.len())
                    .map_err(|_| BuildError::Codec("name arena overflow".to_owned()))?;
                let name_len = u16::try_from(name.len())
                    .map_err(|_| BuildError::Codec("name too long".to_owned()))?;
                names.extend_from_slice(name);
                dirents.push((*child, name_offset, name_len));
            }
            dirent_ranges[idx] = (start, dirents.len() as u32 - start);
        }

        // Symlink table and target arena.
        let mut targets = Vec::new();
        let mut symlinks = Vec::new(); // (target_offset, target_len)
        let mut symlink_index = vec![0_u32; self.inodes.len()];
        for (idx, inode) in self.inodes.iter().enumerate() {
            let NodeData::Symlink(target) = &inode.data else {
                continue;
            };
            symlink_index[idx] = symlinks.len() as u32;
            let offset = u32::try_from(targets.len())
                .map_err(|_| BuildError::Codec("target arena overflow".to_owned()))?;
            targets.extend_from_slice(target);
            symlinks.push((offset, target.len() as u32));
        }

        // Inode records.
        let mut inode_records = Vec::new();
        push_u32(&mut inode_records, self.inodes.len() as u32);
        for (idx, inode) in self.inodes.iter().enumerate() {
            let (start, count, size) = match &inode.data {
                NodeData::Dir(_) => {
                    let (start, count) = dirent_ranges[idx];
                    (start, count, 0)
                }
                NodeData::File(data) => {
                    let (start, count) = chunk_ranges[idx];
                    (start, count, data.len() as u64)
                }
                NodeData::Symlink(target) => (symlink_index[idx], 0, target.len() as u64),
                NodeData::Special => (0, 0, 0),
            };
            push_u16(&mut inode_records, dict_index(&mut modes, inode.mode)?);
            push_u16(&mut inode_records, dict_index(&mut uids, inode.uid)?);
            push_u16(&mut inode_records, dict_index(&mut gids, inode.gid)?);
            push_u16(&mut inode_records, 0);
            push_u64(&mut inode_records, size);
            push_u64(&mut inode_records, inode.mtime);
            push_u32(&mut inode_records, start);
            push_u32(&mut inode_records, count);
            push_u32(&mut inode_records, inode.nlink);
            push_u32(&mut inode_records, inode.rdev);
        }

        let mut chunk_records = Vec::new();
        push_u32(&mut chunk_records, chunks.len() as u32);
        for (block, offset, len) in chunks {
            push_u32(&mut chunk_records, *block);
            push_u32(&mut chunk_records, *offset);
            push_u32(&mut chunk_records, *len);
        }

        let mut dirent_records = Vec::new();
        push_u32(&mut dirent_records, dirents.len() as u32);
        for (inode, name_offset, name_len) in &dirents {
            push_u32(&mut dirent_records, *inode);
            push_u32(&mut dirent_records, *name_offset);
            push_u16(&mut dirent_records, *name_len);
            push_u16(&mut dirent_records, 0);
        }

        let mut symlink_records = Vec::new();
        push_u32(&mut symlink_records, symlinks.len() as u32);
        for (offset, len) in &symlinks {
            push_u32(&mut symlink_records, *offset);
            push_u32(&mut symlink_records, *len);
        }

        let dict_section = |dict: &[u32]| {
            let mut out = Vec::new();
            push_u32(&mut out, dict.len() as u32);
            for value in dict {
                push_u32(&mut out, *value);
            }
            out
        };

        let mut stats = Vec::new();
        push_u64(&mut stats, orig_bytes);
        push_u64(&mut stats, block_count);
        push_u64(&mut stats, self.inodes.len() as u64);

        let sections: Vec<(u16, Vec<u8>)> = vec![
            (SECTION_INODES, inode_records),
            (SECTION_CHUNKS, chunk_records),
            (SECTION_DIRENTS, dirent_records),
            (SECTION_SYMLINKS, symlink_records),
            (SECTION_TARGETS, targets),
            (SECTION_NAMES, names),
            (SECTION_MODES, dict_section(&modes)),
            (SECTION_UIDS, dict_section(&uids)),
            (SECTION_GIDS, dict_section(&gids)),
            (SECTION_STATS, stats),
        ];

        let mut meta = Vec::new();
        push_u32(&mut meta, sections.len() as u32);
        let mut payload_offset = 4 + sections.len() * SECTION_DESC_LEN;
        let mut payloads = Vec::new();
        for (tag, payload) in &sections {
            push_u16(&mut meta, *tag);
            push_u16(&mut meta, 0);
            push_u64(&mut meta, payload_offset as u64);
            push_u64(&mut meta, payload.len() as u64);
            payload_offset += payload.len();
            payloads.extend_from_slice(payload);
        }
        meta.extend_from_slice(&payloads);
        Ok(meta)
    }
}

fn split_path(path: &str) -> Result<(String, String), BuildError> {
    let trimmed = path.trim_end_matches('/');
    let Some(slash) = trimmed.rfind('/') else {
        return Err(BuildError::BadPath(path.to_owned()));
    };
    let parent = if slash == 0 { "/" } else { &trimmed[..slash] };
    let name = &trimmed[slash + 1..];
    if name.is_empty() {
        return Err(BuildError::BadPath(path.to_owned()));
    }
    Ok((parent.to_owned(), name.to_owned()))
}

fn leaf_name(path: &str) -> Result<Vec<u8>, BuildError> {
    let (_, name) = split_path(path)?;
    Ok(name.into_bytes())
}

fn compress(codec: CodecTag, block: &[u8]) -> Result<Vec<u8>, BuildError> {
    match codec {
        CodecTag::None => Ok(block.to_vec()),
        CodecTag::Zstd => {
            zstd::bulk::compress(block, 3).map_err(|err| BuildError::Codec(err.to_string()))
        }
        CodecTag::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_compress(&mut &block[..], &mut out)
                .map_err(|err| BuildError::Codec(err.to_string()))?;
            Ok(out)
        }
        CodecTag::Lz4 => Ok(lz4_flex::block::compress(block)),
        CodecTag::Brotli => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer
                .write_all(block)
                .map_err(|err| BuildError::Codec(err.to_string()))?;
            drop(writer);
            Ok(out)
        }
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_ondisk::{ImageHeader, MetadataLayout, MetadataRef};
    use sfs_types::InodeIndex;

    #[test]
    fn empty_image_has_only_root() {
        let image = ImageBuilder::new(16).expect("builder").build().expect("build");
        let header = ImageHeader::parse(&image, image.len() as u64).expect("header");
        assert_eq!(header.num_blocks(), 0);

        let meta = &image[header.metadata_offset as usize
            ..(header.metadata_offset + header.metadata_len) as usize];
        let layout = MetadataLayout::parse(meta).expect("layout");
        assert_eq!(layout.inode_count(), 1);
        let view = MetadataRef::new(meta, &layout);
        view.check_consistency(&header).expect("consistent");
    }

    #[test]
    fn multi_block_file_spans_blocks() {
        let mut builder = ImageBuilder::new(12).expect("builder");
        let data: Vec<u8> = (0..10_000_u32).map(|i| (i % 256) as u8).collect();
        builder.file("/big", &data).expect("file");
        let image = builder.build().expect("build");

        let header = ImageHeader::parse(&image, image.len() as u64).expect("header");
        // 10_000 bytes over 4096-byte blocks.
        assert_eq!(header.num_blocks(), 3);
        assert_eq!(header.last_block_len, 10_000 - 2 * 4096);

        let meta = &image[header.metadata_offset as usize
            ..(header.metadata_offset + header.metadata_len) as usize];
        let layout = MetadataLayout::parse(meta).expect("layout");
        assert_eq!(layout.chunk_count(), 3);
        let view = MetadataRef::new(meta, &layout);
        view.check_consistency(&header).expect("consistent");

        let file = view.inode(InodeIndex(1)).expect("file inode");
        assert_eq!(file.size, 10_000);
        assert_eq!(file.count, 3);
    }

    #[test]
    fn dirents_are_sorted_by_name() {
        let mut builder = ImageBuilder::new(16).expect("builder");
        builder.file("/zebra", b"z").expect("file");
        builder.file("/alpha", b"a").expect("file");
        builder.file("/mid", b"m").expect("file");
        let image = builder.build().expect("build");

        let header = ImageHeader::parse(&image, image.len() as u64).expect("header");
        let meta = &image[header.metadata_offset as usize
            ..(header.metadata_offset + header.metadata_len) as usize];
        let layout = MetadataLayout::parse(meta).expect("layout");
        let view = MetadataRef::new(meta, &layout);

        let root = view.inode(InodeIndex::ROOT).expect("root");
        let names: Vec<Vec<u8>> = (root.start..root.start + root.count)
            .map(|i| {
                let dirent = view.dirent(i).expect("dirent");
                view.dirent_name(dirent).expect("name").to_vec()
            })
            .collect();
        assert_eq!(names, vec![b"alpha".to_vec(), b"mid".to_vec(), b"zebra".to_vec()]);
    }

    #[test]
    fn hardlinks_share_an_inode() {
        let mut builder = ImageBuilder::new(16).expect("builder");
        builder.file("/data", b"payload").expect("file");
        builder.hardlink("/alias", "/data").expect("hardlink");
        let image = builder.build().expect("build");

        let header = ImageHeader::parse(&image, image.len() as u64).expect("header");
        let meta = &image[header.metadata_offset as usize
            ..(header.metadata_offset + header.metadata_len) as usize];
        let layout = MetadataLayout::parse(meta).expect("layout");
        assert_eq!(layout.inode_count(), 2);
        let view = MetadataRef::new(meta, &layout);

        let root = view.inode(InodeIndex::ROOT).expect("root");
        assert_eq!(root.count, 2);
        let first = view.dirent(root.start).expect("dirent");
        let second = view.dirent(root.start + 1).expect("dirent");
        assert_eq!(first.inode, second.inode);
        let file = view.inode(InodeIndex(first.inode)).expect("file");
        assert_eq!(file.nlink, 2);
    }

    #[test]
    fn rejects_orphan_paths() {
        let mut builder = ImageBuilder::new(16).expect("builder");
        assert!(builder.file("/missing/child", b"x").is_err());
        assert!(builder.dir("/").is_err());
        builder.file("/a", b"x").expect("file");
        assert!(builder.file("/a", b"again").is_err());
    }

    #[test]
    fn prelude_shifts_the_image() {
        let mut builder = ImageBuilder::new(16).expect("builder");
        builder.prelude(b"#!/bin/sh\n").file("/f", b"x").expect("file");
        let image = builder.build().expect("build");
        assert!(image.starts_with(b"#!/bin/sh\n"));
        assert_eq!(ImageHeader::scan_for_image(&image), Some(10));
    }
}
