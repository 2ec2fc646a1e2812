#![forbid(unsafe_code)]
//! On-disk structures of the StrataFS image format.
//!
//! Everything here parses from little-endian byte slices into plain
//! structs or pure offset layouts; no I/O happens in this crate. The
//! metadata section is self-describing (a section table with tagged
//! entries) and readers skip unknown tags for forward compatibility.

use sfs_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, u64_to_usize, BlockId,
    BlockSizeExp, InodeIndex, ParseError, BLOCK_INDEX_RECORD_LEN, CHUNK_RECORD_LEN,
    DIRENT_RECORD_LEN, FORMAT_MAJOR, IMAGE_HEADER_LEN, IMAGE_MAGIC, INODE_RECORD_LEN,
    SECTION_DESC_LEN, SYMLINK_RECORD_LEN,
};

// ── Image header ────────────────────────────────────────────────────────────

/// Parsed and validated fixed image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: (u16, u16, u16),
    pub feature_flags: u32,
    pub block_size: BlockSizeExp,
    pub metadata_offset: u64,
    pub metadata_len: u64,
    pub block_index_offset: u64,
    pub block_index_len: u64,
    pub last_block_len: u64,
}

impl ImageHeader {
    /// Parse the 64-byte header from the start of the image.
    ///
    /// `image_len` is the number of bytes available from the image
    /// start to the end of the container; section spans are validated
    /// against it.
    pub fn parse(data: &[u8], image_len: u64) -> Result<Self, ParseError> {
        let magic: [u8; 8] = read_fixed(data, 0)?;
        if magic != IMAGE_MAGIC {
            return Err(ParseError::InvalidMagic);
        }

        let major = read_le_u16(data, 8)?;
        let minor = read_le_u16(data, 10)?;
        let patch = read_le_u16(data, 12)?;
        if major != FORMAT_MAJOR {
            return Err(ParseError::UnsupportedVersion {
                major,
                minor,
                patch,
            });
        }

        let feature_flags = read_le_u32(data, 16)?;
        let block_size = BlockSizeExp::new(ensure_slice(data, 20, 1)?[0])?;
        let metadata_offset = read_le_u64(data, 24)?;
        let metadata_len = read_le_u64(data, 32)?;
        let block_index_offset = read_le_u64(data, 40)?;
        let block_index_len = read_le_u64(data, 48)?;
        let last_block_len = read_le_u64(data, 56)?;

        let header = Self {
            version: (major, minor, patch),
            feature_flags,
            block_size,
            metadata_offset,
            metadata_len,
            block_index_offset,
            block_index_len,
            last_block_len,
        };
        header.validate(image_len)?;
        Ok(header)
    }

    fn validate(&self, image_len: u64) -> Result<(), ParseError> {
        let span_ok = |offset: u64, len: u64| {
            offset
                .checked_add(len)
                .is_some_and(|end| end <= image_len)
        };
        if !span_ok(self.metadata_offset, self.metadata_len) {
            return Err(ParseError::InvalidField {
                field: "metadata_span",
                reason: "extends past end of image",
            });
        }
        if !span_ok(self.block_index_offset, self.block_index_len) {
            return Err(ParseError::InvalidField {
                field: "block_index_span",
                reason: "extends past end of image",
            });
        }
        if self.block_index_len % BLOCK_INDEX_RECORD_LEN as u64 != 0 {
            return Err(ParseError::InvalidField {
                field: "block_index_len",
                reason: "not a multiple of the record size",
            });
        }
        let num_blocks = self.block_index_len / BLOCK_INDEX_RECORD_LEN as u64;
        if u32::try_from(num_blocks).is_err() {
            return Err(ParseError::InvalidField {
                field: "block_index_len",
                reason: "too many blocks",
            });
        }
        if num_blocks == 0 && self.last_block_len != 0 {
            return Err(ParseError::InvalidField {
                field: "last_block_len",
                reason: "nonzero with an empty block index",
            });
        }
        if num_blocks > 0
            && (self.last_block_len == 0
                || self.last_block_len > u64::from(self.block_size.block_size()))
        {
            return Err(ParseError::InvalidField {
                field: "last_block_len",
                reason: "must be in 1..=block_size",
            });
        }
        Ok(())
    }

    /// Number of blocks recorded in the block index.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // validated in parse()
    pub fn num_blocks(&self) -> u32 {
        (self.block_index_len / BLOCK_INDEX_RECORD_LEN as u64) as u32
    }

    /// Decompressed length of a given block.
    ///
    /// Every block is exactly the image block size except the last.
    #[must_use]
    pub fn decompressed_len(&self, block: BlockId) -> u64 {
        if block.0 + 1 == self.num_blocks() {
            self.last_block_len
        } else {
            u64::from(self.block_size.block_size())
        }
    }

    /// Scan a container for the image magic, returning the offset of
    /// the first position at which a header parses.
    ///
    /// Used for images embedded behind a shell-script prelude when the
    /// caller asks for automatic offset detection.
    #[must_use]
    pub fn scan_for_image(container: &[u8]) -> Option<u64> {
        let mut pos = 0_usize;
        while pos + IMAGE_HEADER_LEN <= container.len() {
            match memchr_magic(&container[pos..]) {
                Some(rel) => {
                    let at = pos + rel;
                    let remaining = (container.len() - at) as u64;
                    if Self::parse(&container[at..], remaining).is_ok() {
                        return Some(at as u64);
                    }
                    pos = at + 1;
                }
                None => return None,
            }
        }
        None
    }
}

/// Position of the next occurrence of the first magic byte that is
/// followed by the full magic sequence.
fn memchr_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(IMAGE_MAGIC.len())
        .position(|w| w == IMAGE_MAGIC)
}

// ── Block index ─────────────────────────────────────────────────────────────

/// One block-index record: where a block's compressed bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    /// Offset of the compressed bytes, relative to the image start.
    pub data_offset: u64,
    pub compressed_len: u32,
    /// Raw codec byte; decode via `CodecTag::from_raw` at use time so
    /// images with unknown codecs still mount (spec'd retry policy).
    pub codec_raw: u8,
}

/// Read view over the block-index span.
#[derive(Debug, Clone, Copy)]
pub struct BlockIndexRef<'a> {
    data: &'a [u8],
}

impl<'a> BlockIndexRef<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded by header validation
    pub fn len(&self) -> u32 {
        (self.data.len() / BLOCK_INDEX_RECORD_LEN) as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() < BLOCK_INDEX_RECORD_LEN
    }

    pub fn entry(&self, block: BlockId) -> Result<BlockIndexEntry, ParseError> {
        let offset = block.0 as usize * BLOCK_INDEX_RECORD_LEN;
        let record = ensure_slice(self.data, offset, BLOCK_INDEX_RECORD_LEN)?;
        Ok(BlockIndexEntry {
            data_offset: read_le_u64(record, 0)?,
            compressed_len: read_le_u32(record, 8)?,
            codec_raw: record[12],
        })
    }
}

// ── Metadata section tags ───────────────────────────────────────────────────

pub const SECTION_INODES: u16 = 1;
pub const SECTION_CHUNKS: u16 = 2;
pub const SECTION_DIRENTS: u16 = 3;
pub const SECTION_SYMLINKS: u16 = 4;
pub const SECTION_TARGETS: u16 = 5;
pub const SECTION_NAMES: u16 = 6;
pub const SECTION_MODES: u16 = 7;
pub const SECTION_UIDS: u16 = 8;
pub const SECTION_GIDS: u16 = 9;
pub const SECTION_STATS: u16 = 10;

// ── Raw metadata records ────────────────────────────────────────────────────

/// Packed inode record.
///
/// `start`/`count` address the chunk table (regular files), the dirent
/// table (directories) or the symlink table (`start` only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInode {
    pub mode_index: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub size: u64,
    pub mtime: u64,
    pub start: u32,
    pub count: u32,
    pub nlink: u32,
    pub rdev: u32,
}

/// Packed chunk record: a span of one decompressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk {
    pub block_id: u32,
    pub offset: u32,
    pub len: u32,
}

/// Packed directory entry. Names are spans into the names arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDirent {
    pub inode: u32,
    pub name_offset: u32,
    pub name_len: u16,
}

/// Packed symlink record: a span into the targets arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSymlink {
    pub target_offset: u32,
    pub target_len: u32,
}

/// Aggregate statistics stored at image-build time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    /// Total decompressed bytes of all regular files.
    pub orig_bytes: u64,
    pub block_count: u64,
    pub inode_count: u64,
}

// ── Metadata layout ─────────────────────────────────────────────────────────

/// Byte range of one section within the metadata span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SectionSpan {
    offset: usize,
    len: usize,
}

/// Table section: payload starts with a `u32` count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TableSpan {
    /// Offset of the first record (past the count word).
    offset: usize,
    count: u32,
}

/// Pure offset layout of the packed metadata, computed once at mount.
///
/// Holding offsets rather than slices keeps the layout free of
/// lifetimes; accessors go through [`MetadataRef`] which borrows the
/// mapped metadata span per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataLayout {
    inodes: TableSpan,
    chunks: TableSpan,
    dirents: TableSpan,
    symlinks: TableSpan,
    modes: TableSpan,
    uids: TableSpan,
    gids: TableSpan,
    targets: SectionSpan,
    names: SectionSpan,
    stats: FsStats,
}

impl MetadataLayout {
    /// Parse the section table and locate every known section.
    ///
    /// Unknown section tags are skipped. Missing mandatory sections
    /// (inodes, modes, uids, gids, stats) are an error; the remaining
    /// tables may legitimately be empty or absent in images without
    /// the corresponding entries.
    pub fn parse(meta: &[u8]) -> Result<Self, ParseError> {
        let section_count = read_le_u32(meta, 0)? as usize;

        let mut inodes = None;
        let mut chunks = None;
        let mut dirents = None;
        let mut symlinks = None;
        let mut modes = None;
        let mut uids = None;
        let mut gids = None;
        let mut targets = None;
        let mut names = None;
        let mut stats = None;

        for i in 0..section_count {
            let desc_off = 4 + i * SECTION_DESC_LEN;
            let desc = ensure_slice(meta, desc_off, SECTION_DESC_LEN)?;
            let tag = read_le_u16(desc, 0)?;
            let offset = u64_to_usize(read_le_u64(desc, 4)?, "section_offset")?;
            let len = u64_to_usize(read_le_u64(desc, 12)?, "section_len")?;
            let payload = ensure_slice(meta, offset, len)?;

            match tag {
                SECTION_INODES => inodes = Some(table_span(payload, offset, INODE_RECORD_LEN)?),
                SECTION_CHUNKS => chunks = Some(table_span(payload, offset, CHUNK_RECORD_LEN)?),
                SECTION_DIRENTS => dirents = Some(table_span(payload, offset, DIRENT_RECORD_LEN)?),
                SECTION_SYMLINKS => {
                    symlinks = Some(table_span(payload, offset, SYMLINK_RECORD_LEN)?);
                }
                SECTION_MODES => modes = Some(table_span(payload, offset, 4)?),
                SECTION_UIDS => uids = Some(table_span(payload, offset, 4)?),
                SECTION_GIDS => gids = Some(table_span(payload, offset, 4)?),
                SECTION_TARGETS => targets = Some(SectionSpan { offset, len }),
                SECTION_NAMES => names = Some(SectionSpan { offset, len }),
                SECTION_STATS => {
                    stats = Some(FsStats {
                        orig_bytes: read_le_u64(payload, 0)?,
                        block_count: read_le_u64(payload, 8)?,
                        inode_count: read_le_u64(payload, 16)?,
                    });
                }
                // Forward compatibility: newer writers may add sections.
                _ => {}
            }
        }

        let missing = |field| ParseError::InvalidField {
            field,
            reason: "mandatory section missing",
        };

        let layout = Self {
            inodes: inodes.ok_or_else(|| missing("inodes"))?,
            chunks: chunks.unwrap_or_default(),
            dirents: dirents.unwrap_or_default(),
            symlinks: symlinks.unwrap_or_default(),
            modes: modes.ok_or_else(|| missing("modes"))?,
            uids: uids.ok_or_else(|| missing("uids"))?,
            gids: gids.ok_or_else(|| missing("gids"))?,
            targets: targets.unwrap_or_default(),
            names: names.unwrap_or_default(),
            stats: stats.ok_or_else(|| missing("stats"))?,
        };

        if layout.inodes.count == 0 {
            return Err(ParseError::InvalidField {
                field: "inodes",
                reason: "image has no root inode",
            });
        }

        Ok(layout)
    }

    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.inodes.count
    }

    #[must_use]
    pub fn chunk_count(&self) -> u32 {
        self.chunks.count
    }

    #[must_use]
    pub fn dirent_count(&self) -> u32 {
        self.dirents.count
    }

    #[must_use]
    pub fn symlink_count(&self) -> u32 {
        self.symlinks.count
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        self.stats
    }
}

fn table_span(payload: &[u8], offset: usize, record_len: usize) -> Result<TableSpan, ParseError> {
    let count = read_le_u32(payload, 0)?;
    let needed = (count as usize)
        .checked_mul(record_len)
        .and_then(|n| n.checked_add(4))
        .ok_or(ParseError::InvalidField {
            field: "table_count",
            reason: "record span overflow",
        })?;
    if needed > payload.len() {
        return Err(ParseError::InsufficientData {
            needed,
            offset,
            actual: payload.len(),
        });
    }
    Ok(TableSpan {
        offset: offset + 4,
        count,
    })
}

// ── Metadata read view ──────────────────────────────────────────────────────

/// Borrowing accessor over the metadata span plus its layout.
///
/// All record reads were bounds-checked when the layout was built, so
/// accessors only fail on out-of-range indexes.
#[derive(Debug, Clone, Copy)]
pub struct MetadataRef<'a> {
    meta: &'a [u8],
    layout: &'a MetadataLayout,
}

impl<'a> MetadataRef<'a> {
    #[must_use]
    pub fn new(meta: &'a [u8], layout: &'a MetadataLayout) -> Self {
        Self { meta, layout }
    }

    #[must_use]
    pub fn layout(&self) -> &'a MetadataLayout {
        self.layout
    }

    pub fn inode(&self, index: InodeIndex) -> Result<RawInode, ParseError> {
        let record = self.record(&self.layout.inodes, index.0, INODE_RECORD_LEN, "inode")?;
        Ok(RawInode {
            mode_index: read_le_u16(record, 0)?,
            uid_index: read_le_u16(record, 2)?,
            gid_index: read_le_u16(record, 4)?,
            size: read_le_u64(record, 8)?,
            mtime: read_le_u64(record, 16)?,
            start: read_le_u32(record, 24)?,
            count: read_le_u32(record, 28)?,
            nlink: read_le_u32(record, 32)?,
            rdev: read_le_u32(record, 36)?,
        })
    }

    pub fn chunk(&self, index: u32) -> Result<RawChunk, ParseError> {
        let record = self.record(&self.layout.chunks, index, CHUNK_RECORD_LEN, "chunk")?;
        Ok(RawChunk {
            block_id: read_le_u32(record, 0)?,
            offset: read_le_u32(record, 4)?,
            len: read_le_u32(record, 8)?,
        })
    }

    pub fn dirent(&self, index: u32) -> Result<RawDirent, ParseError> {
        let record = self.record(&self.layout.dirents, index, DIRENT_RECORD_LEN, "dirent")?;
        Ok(RawDirent {
            inode: read_le_u32(record, 0)?,
            name_offset: read_le_u32(record, 4)?,
            name_len: read_le_u16(record, 8)?,
        })
    }

    pub fn symlink(&self, index: u32) -> Result<RawSymlink, ParseError> {
        let record = self.record(&self.layout.symlinks, index, SYMLINK_RECORD_LEN, "symlink")?;
        Ok(RawSymlink {
            target_offset: read_le_u32(record, 0)?,
            target_len: read_le_u32(record, 4)?,
        })
    }

    /// Name bytes of a directory entry.
    pub fn dirent_name(&self, dirent: RawDirent) -> Result<&'a [u8], ParseError> {
        let arena = ensure_slice(self.meta, self.layout.names.offset, self.layout.names.len)?;
        ensure_slice(arena, dirent.name_offset as usize, usize::from(dirent.name_len))
    }

    /// Target bytes of a symlink record.
    pub fn symlink_target(&self, link: RawSymlink) -> Result<&'a [u8], ParseError> {
        let arena = ensure_slice(self.meta, self.layout.targets.offset, self.layout.targets.len)?;
        ensure_slice(arena, link.target_offset as usize, link.target_len as usize)
    }

    pub fn mode(&self, index: u16) -> Result<u32, ParseError> {
        self.dict(&self.layout.modes, index, "mode")
    }

    pub fn uid(&self, index: u16) -> Result<u32, ParseError> {
        self.dict(&self.layout.uids, index, "uid")
    }

    pub fn gid(&self, index: u16) -> Result<u32, ParseError> {
        self.dict(&self.layout.gids, index, "gid")
    }

    fn record(
        &self,
        table: &TableSpan,
        index: u32,
        record_len: usize,
        field: &'static str,
    ) -> Result<&'a [u8], ParseError> {
        if index >= table.count {
            return Err(ParseError::InvalidField {
                field,
                reason: "index out of range",
            });
        }
        ensure_slice(
            self.meta,
            table.offset + index as usize * record_len,
            record_len,
        )
    }

    fn dict(&self, table: &TableSpan, index: u16, field: &'static str) -> Result<u32, ParseError> {
        let record = self.record(table, u32::from(index), 4, field)?;
        read_le_u32(record, 0)
    }

    /// Mount-time consistency check.
    ///
    /// Verifies for every inode that its table range is in bounds and
    /// its dictionary indexes resolve, and for every chunk that
    /// `block_id < num_blocks` and `offset + len <= block_size`
    /// (the final block additionally bounded by its recorded length).
    pub fn check_consistency(&self, header: &ImageHeader) -> Result<(), ParseError> {
        let block_size = u64::from(header.block_size.block_size());
        let num_blocks = header.num_blocks();

        for i in 0..self.layout.chunks.count {
            let chunk = self.chunk(i)?;
            if chunk.block_id >= num_blocks {
                return Err(ParseError::InvalidField {
                    field: "chunk.block_id",
                    reason: "references a block past the index",
                });
            }
            let end = u64::from(chunk.offset) + u64::from(chunk.len);
            if end > block_size || end > header.decompressed_len(BlockId(chunk.block_id)) {
                return Err(ParseError::InvalidField {
                    field: "chunk",
                    reason: "span exceeds the decompressed block",
                });
            }
        }

        for i in 0..self.layout.inodes.count {
            let inode = self.inode(InodeIndex(i))?;
            let mode = self.mode(inode.mode_index)?;
            self.uid(inode.uid_index)?;
            self.gid(inode.gid_index)?;

            let end = u64::from(inode.start) + u64::from(inode.count);
            let table_len = match mode & sfs_types::S_IFMT {
                sfs_types::S_IFREG => u64::from(self.layout.chunks.count),
                sfs_types::S_IFDIR => u64::from(self.layout.dirents.count),
                sfs_types::S_IFLNK => {
                    if inode.start >= self.layout.symlinks.count {
                        return Err(ParseError::InvalidField {
                            field: "inode.start",
                            reason: "symlink index out of range",
                        });
                    }
                    continue;
                }
                _ => continue,
            };
            if end > table_len {
                return Err(ParseError::InvalidField {
                    field: "inode",
                    reason: "table range out of bounds",
                });
            }
        }

        for i in 0..self.layout.dirents.count {
            let dirent = self.dirent(i)?;
            self.dirent_name(dirent)?;
            if dirent.inode >= self.layout.inodes.count {
                return Err(ParseError::InvalidField {
                    field: "dirent.inode",
                    reason: "references an inode past the table",
                });
            }
        }

        for i in 0..self.layout.symlinks.count {
            self.symlink_target(self.symlink(i)?)?;
        }

        Ok(())
    }
}
