#![forbid(unsafe_code)]
//! FUSE adapter for StrataFS.
//!
//! A thin translation layer: kernel requests arrive via the `fuser`
//! crate, get forwarded to an [`FsOps`] implementation (from
//! `sfs-core`), and errors are mapped through `SfsError::to_errno()`.
//! Worker spawn and tidy-timer start are deferred to the `init`
//! callback — they must not happen before the driver shell forks.

use fuser::{
    consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE},
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use sfs_core::{FsOps, XattrReply};
use sfs_types::{FileKind, InodeNum, TidyConfig};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// TTL for cached attributes and entries.
///
/// The image is immutable, so the longest expressible timeout is safe.
const ATTR_TTL: Duration = Duration::from_secs(u32::MAX as u64);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_file_attr(attr: &sfs_core::InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.mtime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.mtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

/// Settings the adapter applies in the kernel `init` callback, after
/// the driver shell has daemonized.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitSettings {
    pub workers: usize,
    pub tidy: TidyConfig,
}

impl InitSettings {
    #[must_use]
    pub fn new(workers: usize, tidy: TidyConfig) -> Self {
        Self { workers, tidy }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating all operations to an [`FsOps`]
/// implementation.
///
/// Unimplemented operations return `ENOSYS` via fuser's default method
/// implementations; writes are never wired at all.
pub struct StrataFuse {
    ops: Box<dyn FsOps>,
    init: InitSettings,
}

impl StrataFuse {
    #[must_use]
    pub fn new(ops: Box<dyn FsOps>, init: InitSettings) -> Self {
        Self { ops, init }
    }
}

impl Filesystem for StrataFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        // Deferred until after the driver shell forked into the
        // background: thread spawn before the fork would be lost.
        self.ops.set_num_workers(self.init.workers);
        self.ops.set_cache_tidy(self.init.tidy);
        debug!(target: "sfs::fuse", event = "driver_initialized", workers = self.init.workers);
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.ops.lookup(InodeNum(parent), name.as_bytes()) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => {
                // ENOENT is expected for missing entries — don't warn.
                if !e.is_not_found() {
                    warn!(parent, ?name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.ops.getattr(InodeNum(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => {
                warn!(ino, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let mask = u32::try_from(mask).unwrap_or(0);
        match self.ops.access(InodeNum(ino), mask, req.uid(), req.gid()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        // Images without symlinks never serve this op.
        if !self.ops.has_symlinks() {
            reply.error(libc::ENOSYS);
            return;
        }
        match self.ops.readlink(InodeNum(ino)) {
            Ok(target) => reply.data(&target),
            Err(e) => {
                warn!(ino, error = %e, "readlink failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.ops.open(InodeNum(ino), flags) {
            Ok(out) => {
                let mut open_flags = 0;
                if out.direct_io {
                    open_flags |= FOPEN_DIRECT_IO;
                }
                if out.keep_cache {
                    open_flags |= FOPEN_KEEP_CACHE;
                }
                reply.opened(out.fh, open_flags);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.ops.release(fh);
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.ops.read(fh, offset, size) {
            // fuser's reply takes a single buffer; the scatter-gather
            // reply flattens here, at the outermost edge.
            Ok(sg) => reply.data(&sg.to_vec()),
            Err(e) => {
                warn!(ino, fh, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // Directory handles are stateless; validate the inode only.
        match self.ops.opendir(InodeNum(ino)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.ops.readdir(InodeNum(ino), offset) {
            Ok(entries) => {
                for entry in &entries {
                    let full = reply.add(
                        entry.ino.0,
                        i64::try_from(entry.next_offset).unwrap_or(i64::MAX),
                        to_fuser_file_type(entry.kind),
                        OsStr::from_bytes(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                warn!(ino, offset, error = %e, "readdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.ops.statvfs() {
            Ok(stat) => reply.statfs(
                stat.blocks,
                0,
                0,
                stat.inodes,
                0,
                stat.block_size,
                stat.name_max,
                stat.block_size,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match self
            .ops
            .getxattr(InodeNum(ino), name.as_bytes(), u64::from(size))
        {
            Ok(XattrReply::Size(len)) => reply.size(u32::try_from(len).unwrap_or(u32::MAX)),
            Ok(XattrReply::Data(value)) => reply.data(&value),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.ops.listxattr(InodeNum(ino), u64::from(size)) {
            Ok(XattrReply::Size(len)) => reply.size(u32::try_from(len).unwrap_or(u32::MAX)),
            Ok(XattrReply::Data(value)) => reply.data(&value),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("stratafs".to_owned()),
        MountOption::Subtype("stratafs".to_owned()),
        MountOption::NoAtime,
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Mount at `mountpoint` and serve until unmounted (blocking).
pub fn mount(
    ops: Box<dyn FsOps>,
    init: InitSettings,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let fs = StrataFuse::new(ops, init);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background; unmounts when the session handle drops.
pub fn mount_background(
    ops: Box<dyn FsOps>,
    init: InitSettings,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let fs = StrataFuse::new(ops, init);
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_core::{DirEntryOwned, InodeAttr, OpenOutcome, ReadReply, VfsStat};
    use sfs_error::{Result as SfsResult, SfsError};

    struct StubFs;

    impl FsOps for StubFs {
        fn lookup(&self, _parent: InodeNum, _name: &[u8]) -> SfsResult<InodeAttr> {
            Err(SfsError::NoEntry)
        }
        fn getattr(&self, _ino: InodeNum) -> SfsResult<InodeAttr> {
            Err(SfsError::NoEntry)
        }
        fn access(&self, _ino: InodeNum, _mask: u32, _uid: u32, _gid: u32) -> SfsResult<()> {
            Ok(())
        }
        fn readlink(&self, _ino: InodeNum) -> SfsResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn open(&self, _ino: InodeNum, _flags: i32) -> SfsResult<OpenOutcome> {
            Err(SfsError::AccessDenied)
        }
        fn release(&self, _fh: u64) {}
        fn read(&self, _fh: u64, _offset: u64, _size: u32) -> SfsResult<ReadReply> {
            Ok(ReadReply::default())
        }
        fn opendir(&self, _ino: InodeNum) -> SfsResult<()> {
            Ok(())
        }
        fn readdir(&self, _ino: InodeNum, _offset: u64) -> SfsResult<Vec<DirEntryOwned>> {
            Ok(Vec::new())
        }
        fn statvfs(&self) -> SfsResult<VfsStat> {
            Err(SfsError::Io(std::io::Error::other("stub")))
        }
        fn getxattr(&self, _ino: InodeNum, _name: &[u8], _size: u64) -> SfsResult<XattrReply> {
            Err(SfsError::NoAttr)
        }
        fn listxattr(&self, _ino: InodeNum, _size: u64) -> SfsResult<XattrReply> {
            Ok(XattrReply::Size(0))
        }
        fn has_symlinks(&self) -> bool {
            false
        }
    }

    #[test]
    fn file_type_conversion_covers_all_kinds() {
        let cases = [
            (FileKind::Regular, FileType::RegularFile),
            (FileKind::Directory, FileType::Directory),
            (FileKind::Symlink, FileType::Symlink),
            (FileKind::BlockDevice, FileType::BlockDevice),
            (FileKind::CharDevice, FileType::CharDevice),
            (FileKind::Fifo, FileType::NamedPipe),
            (FileKind::Socket, FileType::Socket),
        ];
        for (kind, expected) in cases {
            assert_eq!(to_fuser_file_type(kind), expected);
        }
    }

    #[test]
    fn inode_attr_conversion() {
        let attr = InodeAttr {
            ino: InodeNum(42),
            size: 1024,
            blocks: 2,
            kind: FileKind::Regular,
            perm: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            mtime: std::time::SystemTime::UNIX_EPOCH,
            blksize: 512 * 1024,
        };
        let fattr = to_file_attr(&attr);
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 1024);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.atime, fattr.mtime);
        assert_eq!(fattr.blksize, 512 * 1024);
    }

    #[test]
    fn mount_options_default_is_read_only() {
        let opts = MountOptions::default();
        assert!(opts.read_only);
        assert!(!opts.allow_other);
        let mount_opts = build_mount_options(&opts);
        assert!(mount_opts.contains(&MountOption::RO));
        assert!(mount_opts.contains(&MountOption::NoAtime));
        assert!(!mount_opts.contains(&MountOption::AllowOther));
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let err = mount(
            Box::new(StubFs),
            InitSettings::default(),
            "",
            &MountOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn adapter_construction() {
        let _fuse = StrataFuse::new(
            Box::new(StubFs),
            InitSettings::new(2, TidyConfig::default()),
        );
    }
}
