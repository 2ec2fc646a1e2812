#![forbid(unsafe_code)]
//! Zero-copy read view over the packed metadata section.
//!
//! Resolves names to inodes and inodes to attributes, directory
//! ranges, symlink targets and chunk lists. The view is read-only
//! after construction and shared across driver threads without
//! synchronization; lookups allocate nothing — names and chunks are
//! spans into the mapped region.

use sfs_block::ImageMap;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{MetadataLayout, MetadataRef, RawInode};
use sfs_types::{
    BlockId, FileKind, InodeIndex, InodeNum, R_OK, S_IFDIR, S_IFMT, W_OK, X_OK,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Maximum name length advertised through statvfs.
pub const NAME_MAX: u32 = 255;

/// Metadata behavior options.
#[derive(Debug, Clone, Copy)]
pub struct MetadataOptions {
    /// Report stored link counts (and subdirectory counts for
    /// directories) instead of a constant 1.
    pub enable_nlink: bool,
    /// Inode number of the root as seen by the host driver; all inode
    /// numbers are translated by this offset.
    pub inode_offset: u64,
    /// Block size reported in attributes (`st_blksize`), a driver I/O
    /// hint independent of the image block size.
    pub io_block_size: u32,
    /// Advertise a read-only filesystem through statvfs.
    pub readonly: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            enable_nlink: false,
            inode_offset: 1,
            io_block_size: 512 * 1024,
            readonly: false,
        }
    }
}

/// File attributes in driver-neutral form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: InodeNum,
    pub size: u64,
    /// 512-byte units, as `stat(2)` reports them.
    pub blocks: u64,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub mtime: SystemTime,
    pub blksize: u32,
}

/// Separator handling for `readlink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadlinkMode {
    /// Target bytes exactly as stored in the image.
    Raw,
    /// Translate to the platform path separator (identity on Unix).
    Native,
}

/// Open directory handle: the dirent-table range of one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHandle {
    ino: InodeNum,
    first: u32,
    count: u32,
}

impl DirHandle {
    #[must_use]
    pub fn ino(&self) -> InodeNum {
        self.ino
    }
}

/// One `readdir` result. The name borrows from the mapped metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub ino: InodeNum,
    pub kind: FileKind,
    pub name: &'a [u8],
}

/// A chunk reference resolved from the chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub block: BlockId,
    pub offset: u32,
    pub len: u32,
}

/// Aggregate filesystem statistics for `statvfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsStat {
    pub block_size: u32,
    /// Total decompressed bytes of all regular files.
    pub total_bytes: u64,
    /// `total_bytes` in `block_size` units, rounded up.
    pub blocks: u64,
    pub inodes: u64,
    pub name_max: u32,
    pub readonly: bool,
}

/// Read view over a mounted image's metadata.
pub struct MetadataView {
    image: Arc<ImageMap>,
    layout: MetadataLayout,
    options: MetadataOptions,
}

impl MetadataView {
    /// Parse the metadata span and run the mount-time consistency
    /// check. Configuration or image errors abort the mount here.
    pub fn new(image: Arc<ImageMap>, options: MetadataOptions) -> Result<Self> {
        let layout = MetadataLayout::parse(image.metadata())?;
        MetadataRef::new(image.metadata(), &layout).check_consistency(image.header())?;

        debug!(
            target: "sfs::metadata",
            event = "metadata_loaded",
            inodes = layout.inode_count(),
            chunks = layout.chunk_count(),
            dirents = layout.dirent_count(),
            symlinks = layout.symlink_count()
        );

        Ok(Self {
            image,
            layout,
            options,
        })
    }

    fn tables(&self) -> MetadataRef<'_> {
        MetadataRef::new(self.image.metadata(), &self.layout)
    }

    fn inode(&self, ino: InodeNum) -> Result<RawInode> {
        let index = ino
            .to_index(self.options.inode_offset)
            .filter(|idx| idx.0 < self.layout.inode_count())
            .ok_or(SfsError::NoEntry)?;
        Ok(self.tables().inode(index)?)
    }

    fn mode_of(&self, raw: &RawInode) -> Result<u32> {
        Ok(self.tables().mode(raw.mode_index)?)
    }

    fn kind_of(&self, mode: u32) -> Result<FileKind> {
        FileKind::from_mode(mode).ok_or_else(|| {
            SfsError::InvalidImage(format!("unknown file type in mode {mode:#o}"))
        })
    }

    /// Inode number of the root directory.
    #[must_use]
    pub fn root(&self) -> InodeNum {
        InodeIndex::ROOT.to_public(self.options.inode_offset)
    }

    /// Look up `name` in `parent`. Names within a directory are sorted
    /// in the image, so this is a binary search over the dirent range;
    /// no allocation happens on this path.
    pub fn find(&self, parent: InodeNum, name: &[u8]) -> Result<Option<InodeNum>> {
        let raw = self.inode(parent)?;
        let mode = self.mode_of(&raw)?;
        if mode & S_IFMT != S_IFDIR {
            return Err(SfsError::NotDirectory);
        }

        let tables = self.tables();
        let mut lo = raw.start;
        let mut hi = raw.start + raw.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let dirent = tables.dirent(mid)?;
            let mid_name = tables.dirent_name(dirent)?;
            match mid_name.cmp(name) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return Ok(Some(
                        InodeIndex(dirent.inode).to_public(self.options.inode_offset),
                    ));
                }
            }
        }
        Ok(None)
    }

    /// Resolve an absolute path by repeated lookups.
    ///
    /// Symlinks in interior components are not resolved: hitting one
    /// mid-path fails with `NotDirectory`, matching low-level FUSE
    /// lookup semantics where the kernel walks components itself.
    pub fn find_path(&self, path: &str) -> Result<Option<InodeNum>> {
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match self.find(current, component.as_bytes())? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Attributes of an inode.
    pub fn getattr(&self, ino: InodeNum) -> Result<InodeAttr> {
        let raw = self.inode(ino)?;
        let mode = self.mode_of(&raw)?;
        let kind = self.kind_of(mode)?;
        let tables = self.tables();

        #[allow(clippy::cast_possible_truncation)]
        let perm = (mode & 0o7777) as u16;
        Ok(InodeAttr {
            ino,
            size: raw.size,
            blocks: raw.size.div_ceil(512),
            kind,
            perm,
            nlink: self.nlink_of(&raw, kind)?,
            uid: tables.uid(raw.uid_index)?,
            gid: tables.gid(raw.gid_index)?,
            rdev: raw.rdev,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(raw.mtime),
            blksize: self.options.io_block_size,
        })
    }

    fn nlink_of(&self, raw: &RawInode, kind: FileKind) -> Result<u32> {
        if !self.options.enable_nlink {
            return Ok(1);
        }
        if kind != FileKind::Directory {
            return Ok(raw.nlink.max(1));
        }
        // 2 plus one per subdirectory, counted from the entries.
        let tables = self.tables();
        let mut subdirs = 0_u32;
        for i in raw.start..raw.start + raw.count {
            let child = tables.inode(InodeIndex(tables.dirent(i)?.inode))?;
            if tables.mode(child.mode_index)? & S_IFMT == S_IFDIR {
                subdirs += 1;
            }
        }
        Ok(2 + subdirs)
    }

    /// POSIX access check for `mode` (a mask of `R_OK`/`W_OK`/`X_OK`).
    ///
    /// The image is immutable, so write access is always denied. Root
    /// passes read checks outright and execute checks when any execute
    /// bit is set.
    pub fn access(&self, ino: InodeNum, mode: u32, uid: u32, gid: u32) -> Result<()> {
        let raw = self.inode(ino)?;
        if mode & W_OK != 0 {
            return Err(SfsError::AccessDenied);
        }
        let requested = mode & (R_OK | X_OK);
        if requested == 0 {
            return Ok(());
        }

        let file_mode = self.mode_of(&raw)?;
        let tables = self.tables();
        let file_uid = tables.uid(raw.uid_index)?;
        let file_gid = tables.gid(raw.gid_index)?;

        if uid == 0 {
            if requested & X_OK != 0 && file_mode & 0o111 == 0 {
                return Err(SfsError::AccessDenied);
            }
            return Ok(());
        }

        let class_shift = if uid == file_uid {
            6
        } else if gid == file_gid {
            3
        } else {
            0
        };
        let granted = (file_mode >> class_shift) & 0o7;
        if requested & !granted != 0 {
            return Err(SfsError::AccessDenied);
        }
        Ok(())
    }

    /// Symlink target of `ino`.
    pub fn readlink(&self, ino: InodeNum, mode: ReadlinkMode) -> Result<Vec<u8>> {
        let raw = self.inode(ino)?;
        let file_mode = self.mode_of(&raw)?;
        if self.kind_of(file_mode)? != FileKind::Symlink {
            return Err(SfsError::InvalidArgument("not a symlink"));
        }

        let tables = self.tables();
        let record = tables.symlink(raw.start)?;
        let target = tables.symlink_target(record)?;
        match mode {
            ReadlinkMode::Raw => Ok(target.to_vec()),
            ReadlinkMode::Native => {
                if std::path::MAIN_SEPARATOR == '/' {
                    Ok(target.to_vec())
                } else {
                    Ok(target
                        .iter()
                        .map(|b| if *b == b'/' { b'\\' } else { *b })
                        .collect())
                }
            }
        }
    }

    /// Open a directory, returning its entry range.
    pub fn opendir(&self, ino: InodeNum) -> Result<DirHandle> {
        let raw = self.inode(ino)?;
        if self.mode_of(&raw)? & S_IFMT != S_IFDIR {
            return Err(SfsError::NotDirectory);
        }
        Ok(DirHandle {
            ino,
            first: raw.start,
            count: raw.count,
        })
    }

    /// Number of entries in an open directory.
    #[must_use]
    pub fn dirsize(&self, dir: &DirHandle) -> u64 {
        u64::from(dir.count)
    }

    /// Entry at `offset` within the directory, or `None` at the end.
    /// Entries come back in image order (sorted by name).
    pub fn readdir(&self, dir: &DirHandle, offset: u64) -> Result<Option<DirEntry<'_>>> {
        if offset >= u64::from(dir.count) {
            return Ok(None);
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = dir.first + offset as u32;
        let tables = self.tables();
        let dirent = tables.dirent(index)?;
        let child = tables.inode(InodeIndex(dirent.inode))?;
        let kind = self.kind_of(tables.mode(child.mode_index)?)?;
        Ok(Some(DirEntry {
            ino: InodeIndex(dirent.inode).to_public(self.options.inode_offset),
            kind,
            name: tables.dirent_name(dirent)?,
        }))
    }

    /// Ordered chunk list of a regular file.
    pub fn chunks(&self, ino: InodeNum) -> Result<Vec<Chunk>> {
        let raw = self.inode(ino)?;
        let mode = self.mode_of(&raw)?;
        if self.kind_of(mode)? != FileKind::Regular {
            return Err(SfsError::InvalidArgument("not a regular file"));
        }
        let tables = self.tables();
        let mut chunks = Vec::with_capacity(raw.count as usize);
        for i in raw.start..raw.start + raw.count {
            let raw_chunk = tables.chunk(i)?;
            chunks.push(Chunk {
                block: BlockId(raw_chunk.block_id),
                offset: raw_chunk.offset,
                len: raw_chunk.len,
            });
        }
        Ok(chunks)
    }

    /// Whether the image contains any symlinks. Drivers skip wiring
    /// the readlink op when it does not.
    #[must_use]
    pub fn has_symlinks(&self) -> bool {
        self.layout.symlink_count() > 0
    }

    /// Aggregate statistics for `statvfs`.
    #[must_use]
    pub fn statvfs(&self) -> VfsStat {
        let stats = self.layout.stats();
        let block_size = self.image.header().block_size.block_size();
        VfsStat {
            block_size,
            total_bytes: stats.orig_bytes,
            blocks: stats.orig_bytes.div_ceil(u64::from(block_size)),
            inodes: stats.inode_count,
            name_max: NAME_MAX,
            readonly: self.options.readonly,
        }
    }

    /// JSON layout summary of an inode, exposed through the
    /// `inodeinfo` xattr.
    pub fn inode_info(&self, ino: InodeNum) -> Result<serde_json::Value> {
        let raw = self.inode(ino)?;
        let mode = self.mode_of(&raw)?;
        let kind = self.kind_of(mode)?;
        let tables = self.tables();

        let mut info = serde_json::json!({
            "ino": ino.0,
            "type": kind,
            "mode": format!("{:o}", mode & 0o7777),
            "uid": tables.uid(raw.uid_index)?,
            "gid": tables.gid(raw.gid_index)?,
            "size": raw.size,
        });

        if kind == FileKind::Regular {
            let mut chunk_list = Vec::with_capacity(raw.count as usize);
            for i in raw.start..raw.start + raw.count {
                let chunk = tables.chunk(i)?;
                chunk_list.push(serde_json::json!({
                    "block": chunk.block_id,
                    "offset": chunk.offset,
                    "size": chunk.len,
                }));
            }
            info["chunks"] = serde_json::Value::Array(chunk_list);
        }
        Ok(info)
    }

    #[must_use]
    pub fn options(&self) -> &MetadataOptions {
        &self.options
    }

    #[must_use]
    pub fn image(&self) -> &Arc<ImageMap> {
        &self.image
    }
}
