#![forbid(unsafe_code)]
//! Filesystem facade.
//!
//! Ties the image map, metadata view, block cache and inode reader
//! together behind the operation set a host driver consumes. The
//! facade is lock-free on the metadata side; only the open-file table
//! and the cache carry synchronization.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_block::{
    BlockCache, BlockSource, CacheOptions, CacheStats, ImageMap, ImageMapOptions, ImageSource,
    WorkerPool, WorkerPoolConfig,
};
use sfs_error::{Result, SfsError};
use sfs_metadata::{MetadataOptions, MetadataView, ReadlinkMode};
use sfs_reader::{InodeReader, OpenFile, ReaderOptions};
use sfs_types::{FileKind, ImageOffset, InodeNum, MlockMode, TidyConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use sfs_metadata::{DirEntry, InodeAttr, VfsStat};
pub use sfs_reader::ReadReply;

/// Synthesized xattr on the root inode: driver process id.
pub const XATTR_PID: &[u8] = b"user.stratafs.driver.pid";
/// Synthesized xattr on the root inode: cache statistics summary.
pub const XATTR_PERFMON: &[u8] = b"user.stratafs.driver.perfmon";
/// Synthesized xattr on every inode: JSON block-layout summary.
pub const XATTR_INODEINFO: &[u8] = b"user.stratafs.inodeinfo";

/// Extra length headroom advertised for the perfmon xattr, whose
/// value changes between the size query and the read.
const PERFMON_SIZE_HEADROOM: usize = 4096;

/// Runtime configuration of a mount.
///
/// Defaults follow the driver's documented option defaults. Validation
/// happens at mount time; configuration errors abort the mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemOptions {
    /// Block cache byte budget.
    pub cache_bytes: u64,
    /// Driver I/O block size hint (`st_blksize`).
    pub block_size: u32,
    /// Readahead byte budget; 0 disables readahead.
    pub readahead_bytes: u64,
    /// Worker pool threads.
    pub workers: usize,
    pub page_lock: MlockMode,
    /// Fraction of a block past which a cancellable decode finishes
    /// upfront.
    pub decompress_ratio: f64,
    pub image_offset: ImageOffset,
    #[serde(skip)]
    pub tidy: TidyConfig,
    pub seq_detector_threshold: usize,
    pub enable_nlink: bool,
    /// Advertise the mount as read-only through statvfs.
    pub read_only: bool,
    /// Keep the compressed image in the kernel page cache.
    pub cache_image: bool,
    /// Let the kernel cache decompressed file output.
    pub cache_files: bool,
    /// Spawn worker threads at construction. Driver shells that fork
    /// set this to false and call `set_num_workers` after daemonizing.
    pub init_workers: bool,
    /// Inode number of the root as seen by the driver.
    pub inode_offset: u64,
    /// Serve live statistics through the perfmon xattr.
    pub enable_perfmon: bool,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        Self {
            cache_bytes: 512 << 20,
            block_size: 512 << 10,
            readahead_bytes: 0,
            workers: 2,
            page_lock: MlockMode::None,
            decompress_ratio: 0.8,
            image_offset: ImageOffset::Start,
            tidy: TidyConfig::default(),
            seq_detector_threshold: 4,
            enable_nlink: false,
            read_only: false,
            cache_image: false,
            cache_files: true,
            init_workers: true,
            inode_offset: 1,
            enable_perfmon: false,
        }
    }
}

impl FilesystemOptions {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.decompress_ratio) {
            return Err(SfsError::InvalidArgument(
                "decompress_ratio must be between 0.0 and 1.0",
            ));
        }
        if self.workers == 0 {
            return Err(SfsError::InvalidArgument("workers must be at least 1"));
        }
        if self.block_size == 0 {
            return Err(SfsError::InvalidArgument("block_size must be nonzero"));
        }
        Ok(())
    }
}

/// Result of `open`: the file handle plus kernel cache hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
}

/// Owned directory entry, as handed to driver adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryOwned {
    pub ino: InodeNum,
    /// Offset to pass to the next `readdir` call.
    pub next_offset: u64,
    pub kind: FileKind,
    pub name: Vec<u8>,
}

/// Reply to a `getxattr`/`listxattr` request, following the xattr
/// size protocol: a zero-size probe gets the value length, otherwise
/// the data (or `Range` if the caller's buffer is too small).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    Size(u64),
    Data(Vec<u8>),
}

/// Operations a host driver adapter consumes.
///
/// `Filesystem` is the production implementation; adapters hold a
/// `Box<dyn FsOps>` so tests can substitute stubs. Data reads behind
/// this boundary hit the concrete cache and reader — the vtable sits
/// outside the hot path.
pub trait FsOps: Send + Sync {
    fn lookup(&self, parent: InodeNum, name: &[u8]) -> Result<InodeAttr>;
    fn getattr(&self, ino: InodeNum) -> Result<InodeAttr>;
    fn access(&self, ino: InodeNum, mask: u32, uid: u32, gid: u32) -> Result<()>;
    fn readlink(&self, ino: InodeNum) -> Result<Vec<u8>>;
    fn open(&self, ino: InodeNum, flags: i32) -> Result<OpenOutcome>;
    fn release(&self, fh: u64);
    fn read(&self, fh: u64, offset: u64, size: u32) -> Result<ReadReply>;
    fn opendir(&self, ino: InodeNum) -> Result<()>;
    fn readdir(&self, ino: InodeNum, offset: u64) -> Result<Vec<DirEntryOwned>>;
    fn statvfs(&self) -> Result<VfsStat>;
    fn getxattr(&self, ino: InodeNum, name: &[u8], size: u64) -> Result<XattrReply>;
    fn listxattr(&self, ino: InodeNum, size: u64) -> Result<XattrReply>;
    fn has_symlinks(&self) -> bool;

    /// Driver init-callback hooks, invoked after the host shell has
    /// daemonized. Stubs may ignore them.
    fn set_num_workers(&self, _n: usize) {}
    fn set_cache_tidy(&self, _config: TidyConfig) {}
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem").finish_non_exhaustive()
    }
}

/// A mounted image.
pub struct Filesystem {
    meta: MetadataView,
    cache: Arc<BlockCache>,
    reader: InodeReader,
    handles: Mutex<HashMap<u64, Arc<OpenFile>>>,
    next_fh: AtomicU64,
    options: FilesystemOptions,
}

impl Filesystem {
    /// Mount an image file.
    pub fn open_path(path: impl AsRef<Path>, options: FilesystemOptions) -> Result<Self> {
        options.validate()?;
        let map = ImageMap::open(
            path,
            &ImageMapOptions {
                offset: options.image_offset,
                mlock: options.page_lock,
                cache_image: options.cache_image,
            },
        )?;
        Self::from_map(map, options)
    }

    /// Mount an in-memory container (tests, embedded images).
    pub fn from_container(container: Vec<u8>, options: FilesystemOptions) -> Result<Self> {
        options.validate()?;
        let map = ImageMap::from_bytes(
            container,
            &ImageMapOptions {
                offset: options.image_offset,
                mlock: options.page_lock,
                cache_image: options.cache_image,
            },
        )?;
        Self::from_map(map, options)
    }

    fn from_map(map: Arc<ImageMap>, options: FilesystemOptions) -> Result<Self> {
        let source = Arc::new(ImageSource::new(
            Arc::clone(&map),
            options.decompress_ratio,
        ));
        Self::with_source(map, source, options)
    }

    /// Mount with an explicit block source.
    ///
    /// The production path goes through `open_path`; this constructor
    /// lets tests wrap the source (e.g. to count decoder invocations).
    pub fn with_source(
        map: Arc<ImageMap>,
        source: Arc<dyn BlockSource>,
        options: FilesystemOptions,
    ) -> Result<Self> {
        options.validate()?;
        let meta = MetadataView::new(
            Arc::clone(&map),
            MetadataOptions {
                enable_nlink: options.enable_nlink,
                inode_offset: options.inode_offset,
                io_block_size: options.block_size,
                readonly: options.read_only,
            },
        )?;

        let pool = WorkerPool::new(&WorkerPoolConfig {
            workers: options.workers,
            init_workers: options.init_workers,
            ..WorkerPoolConfig::default()
        });
        let cache = BlockCache::new(
            source,
            pool,
            CacheOptions {
                budget_bytes: options.cache_bytes,
                tidy: options.tidy,
                residency_probe: None,
            },
        );
        let reader = InodeReader::new(
            Arc::clone(&cache),
            ReaderOptions {
                readahead_bytes: options.readahead_bytes,
                seq_detector_threshold: options.seq_detector_threshold,
            },
        );

        info!(
            target: "sfs::core",
            event = "filesystem_initialized",
            blocks = map.header().num_blocks(),
            block_size = map.header().block_size.block_size(),
            cache_bytes = options.cache_bytes,
            workers = options.workers
        );

        Ok(Self {
            meta,
            cache,
            reader,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            options,
        })
    }

    /// Resize the worker pool.
    ///
    /// Driver shells that daemonize construct the filesystem with
    /// `init_workers = false` and call this from their init callback,
    /// after the fork; it also performs the deferred thread spawn.
    pub fn set_num_workers(&self, n: usize) {
        self.cache.set_workers(n.max(1));
    }

    /// Replace the cache tidy configuration (also deferred to the
    /// driver's init callback).
    pub fn set_cache_tidy(&self, config: TidyConfig) {
        self.cache.set_tidy(config);
    }

    /// Change the cache byte budget.
    pub fn set_cache_budget(&self, bytes: u64) {
        self.cache.set_budget(bytes);
    }

    #[must_use]
    pub fn root(&self) -> InodeNum {
        self.meta.root()
    }

    #[must_use]
    pub fn options(&self) -> &FilesystemOptions {
        &self.options
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataView {
        &self.meta
    }

    /// Stop background work and release the cache. Called at unmount;
    /// also runs on drop.
    pub fn destroy(&self) {
        self.handles.lock().clear();
        self.cache.shutdown();
        debug!(target: "sfs::core", event = "filesystem_destroyed");
    }

    fn file_for(&self, fh: u64) -> Result<Arc<OpenFile>> {
        self.handles
            .lock()
            .get(&fh)
            .cloned()
            .ok_or(SfsError::BadHandle(fh))
    }

    fn xattr_reply(value: Vec<u8>, size: u64, headroom: usize) -> Result<XattrReply> {
        if size == 0 {
            return Ok(XattrReply::Size((value.len() + headroom) as u64));
        }
        if size >= value.len() as u64 {
            return Ok(XattrReply::Data(value));
        }
        Err(SfsError::Range)
    }
}

impl FsOps for Filesystem {
    fn lookup(&self, parent: InodeNum, name: &[u8]) -> Result<InodeAttr> {
        let ino = self.meta.find(parent, name)?.ok_or(SfsError::NoEntry)?;
        self.meta.getattr(ino)
    }

    fn getattr(&self, ino: InodeNum) -> Result<InodeAttr> {
        self.meta.getattr(ino)
    }

    fn access(&self, ino: InodeNum, mask: u32, uid: u32, gid: u32) -> Result<()> {
        self.meta.access(ino, mask, uid, gid)
    }

    fn readlink(&self, ino: InodeNum) -> Result<Vec<u8>> {
        self.meta.readlink(ino, ReadlinkMode::Native)
    }

    fn open(&self, ino: InodeNum, flags: i32) -> Result<OpenOutcome> {
        let attr = self.meta.getattr(ino)?;
        if attr.kind == FileKind::Directory {
            return Err(SfsError::IsDirectory);
        }
        if flags & libc::O_ACCMODE != libc::O_RDONLY
            || flags & (libc::O_APPEND | libc::O_TRUNC) != 0
        {
            return Err(SfsError::AccessDenied);
        }

        let chunks = self.meta.chunks(ino)?;
        let file = Arc::new(self.reader.open(ino, chunks));
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, file);

        Ok(OpenOutcome {
            fh,
            direct_io: !self.options.cache_files,
            keep_cache: self.options.cache_files,
        })
    }

    fn release(&self, fh: u64) {
        // Dropping the open file also drops its access detector.
        if self.handles.lock().remove(&fh).is_none() {
            warn!(
                target: "sfs::core",
                event = "release_unknown_handle",
                fh
            );
        }
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> Result<ReadReply> {
        let file = self.file_for(fh)?;
        self.reader.read(&file, offset, size)
    }

    fn opendir(&self, ino: InodeNum) -> Result<()> {
        self.meta.opendir(ino).map(|_| ())
    }

    fn readdir(&self, ino: InodeNum, offset: u64) -> Result<Vec<DirEntryOwned>> {
        let dir = self.meta.opendir(ino)?;
        let mut entries = Vec::new();
        let mut position = offset;
        while let Some(entry) = self.meta.readdir(&dir, position)? {
            position += 1;
            entries.push(DirEntryOwned {
                ino: entry.ino,
                next_offset: position,
                kind: entry.kind,
                name: entry.name.to_vec(),
            });
        }
        Ok(entries)
    }

    fn statvfs(&self) -> Result<VfsStat> {
        Ok(self.meta.statvfs())
    }

    fn getxattr(&self, ino: InodeNum, name: &[u8], size: u64) -> Result<XattrReply> {
        // Existence check first so missing inodes beat missing names.
        self.meta.getattr(ino)?;

        if ino == self.meta.root() {
            if name == XATTR_PID {
                let value = std::process::id().to_string().into_bytes();
                return Self::xattr_reply(value, size, 0);
            }
            if name == XATTR_PERFMON {
                return if self.options.enable_perfmon {
                    let value = self.cache.stats().summarize().into_bytes();
                    Self::xattr_reply(value, size, PERFMON_SIZE_HEADROOM)
                } else {
                    Self::xattr_reply(
                        b"performance monitor is disabled\n".to_vec(),
                        size,
                        0,
                    )
                };
            }
        }

        if name == XATTR_INODEINFO {
            let mut value = self.meta.inode_info(ino)?.to_string().into_bytes();
            value.push(b'\n');
            return Self::xattr_reply(value, size, 0);
        }

        Err(SfsError::NoAttr)
    }

    fn listxattr(&self, ino: InodeNum, size: u64) -> Result<XattrReply> {
        self.meta.getattr(ino)?;

        let mut names = Vec::new();
        if ino == self.meta.root() {
            names.extend_from_slice(XATTR_PID);
            names.push(0);
            names.extend_from_slice(XATTR_PERFMON);
            names.push(0);
        }
        names.extend_from_slice(XATTR_INODEINFO);
        names.push(0);
        Self::xattr_reply(names, size, 0)
    }

    fn has_symlinks(&self) -> bool {
        self.meta.has_symlinks()
    }

    fn set_num_workers(&self, n: usize) {
        Filesystem::set_num_workers(self, n);
    }

    fn set_cache_tidy(&self, config: TidyConfig) {
        Filesystem::set_cache_tidy(self, config);
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        self.destroy();
    }
}
