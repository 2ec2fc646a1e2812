#![forbid(unsafe_code)]
//! End-to-end conformance suite.
//!
//! Builds small images with the harness builder and drives them
//! through the public facade, covering the serving scenarios and the
//! cross-component properties (single-flight, budget, pin safety,
//! round-trip, readdir completeness, open errno mapping).

use sfs_block::{ImageMap, ImageMapOptions, ImageSource};
use sfs_core::{Filesystem, FilesystemOptions, FsOps, XattrReply};
use sfs_error::SfsError;
use sfs_harness::{CountingBlockSource, ImageBuilder};
use sfs_types::{CodecTag, FileKind, ImageOffset};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mount a built image with a counting block source in front of the
/// real decoder.
fn mount_counting(
    builder: &ImageBuilder,
    options: FilesystemOptions,
) -> (Filesystem, Arc<CountingBlockSource>) {
    let container = builder.build().expect("build image");
    let map = ImageMap::from_bytes(container, &ImageMapOptions::default()).expect("map");
    let source = CountingBlockSource::new(Arc::new(ImageSource::new(
        Arc::clone(&map),
        options.decompress_ratio,
    )));
    let fs = Filesystem::with_source(map, Arc::clone(&source) as _, options).expect("mount");
    (fs, source)
}

fn mount_plain(builder: &ImageBuilder, options: FilesystemOptions) -> Filesystem {
    Filesystem::from_container(builder.build().expect("build image"), options).expect("mount")
}

/// The 50-byte test file used throughout: bytes 0..=49.
fn fifty_bytes() -> Vec<u8> {
    (0_u8..50).collect()
}

fn read_all(fs: &Filesystem, name: &[u8], offset: u64, len: u32) -> Vec<u8> {
    let ino = fs.lookup(fs.root(), name).expect("lookup").ino;
    let out = fs.open(ino, libc::O_RDONLY).expect("open");
    let data = fs.read(out.fh, offset, len).expect("read").to_vec();
    fs.release(out.fh);
    data
}

// ── Scenario 1: small file ──────────────────────────────────────────────────

#[test]
fn small_file_round_trip() {
    let mut builder = ImageBuilder::new(16).expect("builder");
    builder.file("/hello.txt", b"hello\n").expect("file");
    let fs = mount_plain(&builder, FilesystemOptions::default());

    let attr = fs.lookup(fs.root(), b"hello.txt").expect("lookup");
    assert_eq!(attr.size, 6);
    assert_eq!(attr.kind, FileKind::Regular);

    let out = fs.open(attr.ino, libc::O_RDONLY).expect("open");
    assert_eq!(fs.read(out.fh, 0, 6).expect("read").to_vec(), b"hello\n");
    assert_eq!(fs.read(out.fh, 3, 10).expect("read").to_vec(), b"lo\n");
    assert!(fs.read(out.fh, 6, 10).expect("read").is_empty());
    assert!(fs.read(out.fh, 100, 10).expect("read").is_empty());
}

// ── Scenario 2: multi-block file ────────────────────────────────────────────

#[test]
fn multi_block_reads_request_only_touched_blocks() {
    // Block size 16: the 50-byte file spans 4 blocks.
    let mut builder = ImageBuilder::new(4).expect("builder");
    builder.file("/big", &fifty_bytes()).expect("file");
    let (fs, source) = mount_counting(&builder, FilesystemOptions::default());

    // Bytes 10..40 live in blocks 0, 1 and 2.
    assert_eq!(read_all(&fs, b"big", 10, 30), &fifty_bytes()[10..40]);
    assert_eq!(source.loads(), 3);

    // The full read adds the final block; a repeat decodes nothing.
    assert_eq!(read_all(&fs, b"big", 0, 50), fifty_bytes());
    assert_eq!(source.loads(), 4);
    assert_eq!(read_all(&fs, b"big", 0, 50), fifty_bytes());
    assert_eq!(source.loads(), 4);
}

// ── Scenario 3: concurrent readers (single-flight) ──────────────────────────

#[test]
fn concurrent_readers_share_decodes() {
    let mut builder = ImageBuilder::new(4).expect("builder");
    builder.file("/big", &fifty_bytes()).expect("file");
    let (fs, source) = mount_counting(&builder, FilesystemOptions::default());
    let fs = Arc::new(fs);

    let barrier = Arc::new(std::sync::Barrier::new(32));
    let mut threads = Vec::new();
    for _ in 0..32 {
        let fs = Arc::clone(&fs);
        let barrier = Arc::clone(&barrier);
        threads.push(std::thread::spawn(move || {
            let ino = fs.lookup(fs.root(), b"big").expect("lookup").ino;
            let out = fs.open(ino, libc::O_RDONLY).expect("open");
            barrier.wait();
            let data = fs.read(out.fh, 0, 50).expect("read").to_vec();
            fs.release(out.fh);
            data
        }));
    }
    for thread in threads {
        assert_eq!(thread.join().expect("join"), fifty_bytes());
    }

    // ceil(50 / 16) = 4 decoder invocations, no matter the thread count.
    assert_eq!(source.loads(), 4);
}

// ── Scenario 4: eviction ────────────────────────────────────────────────────

#[test]
fn eviction_keeps_resident_set_within_budget() {
    let mut builder = ImageBuilder::new(4).expect("builder");
    builder.file("/big", &vec![9_u8; 64]).expect("file");
    let (fs, source) = mount_counting(
        &builder,
        FilesystemOptions {
            cache_bytes: 32, // two 16-byte blocks
            ..FilesystemOptions::default()
        },
    );

    let ino = fs.lookup(fs.root(), b"big").expect("lookup").ino;
    let out = fs.open(ino, libc::O_RDONLY).expect("open");
    for block in 0..4_u64 {
        let _ = fs.read(out.fh, block * 16, 16).expect("read");
        let stats = fs.cache_stats();
        assert!(
            stats.resident_blocks <= 2,
            "resident {} after block {block}",
            stats.resident_blocks
        );
    }

    // Most recent block still cached, least recent evicted.
    let loads = source.loads();
    let _ = fs.read(out.fh, 3 * 16, 16).expect("read");
    assert_eq!(source.loads(), loads);
    let _ = fs.read(out.fh, 0, 16).expect("read");
    assert_eq!(source.loads(), loads + 1);
}

// ── Scenario 5: sequential prefetch ─────────────────────────────────────────

#[test]
fn sequential_reads_prefetch_ahead() {
    let mut builder = ImageBuilder::new(4).expect("builder");
    builder.file("/big", &(0..160_u32).map(|i| i as u8).collect::<Vec<_>>()).expect("file");
    let (fs, source) = mount_counting(
        &builder,
        FilesystemOptions {
            readahead_bytes: 4 * 16,
            seq_detector_threshold: 4,
            ..FilesystemOptions::default()
        },
    );

    let ino = fs.lookup(fs.root(), b"big").expect("lookup").ino;
    let out = fs.open(ino, libc::O_RDONLY).expect("open");

    // Four adjacent one-block reads arm the detector; the fourth
    // fires prefetch for the next four blocks.
    for block in 0..4_u64 {
        let _ = fs.read(out.fh, block * 16, 16).expect("read");
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while source.loads() < 8 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(source.loads(), 8);

    // The fifth read is served from the prefetched blocks.
    let _ = fs.read(out.fh, 4 * 16, 16).expect("read");
    assert_eq!(source.loads(), 8);
}

// ── Scenario 6: directory nlink ─────────────────────────────────────────────

#[test]
fn directory_nlink_reflects_subdirectories() {
    let mut builder = ImageBuilder::new(16).expect("builder");
    builder.dir("/a").expect("dir");
    builder.dir("/b").expect("dir");
    builder.file("/f", b"x").expect("file");

    let with_nlink = mount_plain(
        &builder,
        FilesystemOptions {
            enable_nlink: true,
            ..FilesystemOptions::default()
        },
    );
    assert_eq!(with_nlink.getattr(with_nlink.root()).expect("attr").nlink, 4);

    let without = mount_plain(&builder, FilesystemOptions::default());
    assert_eq!(without.getattr(without.root()).expect("attr").nlink, 1);
}

// ── Properties ──────────────────────────────────────────────────────────────

#[test]
fn read_round_trip_for_all_ranges() {
    let data: Vec<u8> = (0..1000_u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    let mut builder = ImageBuilder::new(6).expect("builder"); // 64-byte blocks
    builder.file("/data", &data).expect("file");
    let fs = mount_plain(&builder, FilesystemOptions::default());

    let ino = fs.lookup(fs.root(), b"data").expect("lookup").ino;
    let out = fs.open(ino, libc::O_RDONLY).expect("open");

    for offset in [0_u64, 1, 63, 64, 65, 500, 999, 1000] {
        for len in [0_u32, 1, 63, 64, 65, 200, 1000] {
            let reply = fs.read(out.fh, offset, len).expect("read");
            let start = (offset as usize).min(data.len());
            let end = (offset as usize + len as usize).min(data.len());
            assert_eq!(
                reply.to_vec(),
                &data[start..end],
                "mismatch at offset {offset} len {len}"
            );
        }
    }
}

#[test]
fn readdir_yields_every_child_exactly_once() {
    let mut builder = ImageBuilder::new(16).expect("builder");
    builder.dir("/docs").expect("dir");
    builder.dir("/docs/old").expect("dir");
    builder.file("/docs/readme", b"r").expect("file");
    builder.file("/docs/todo", b"t").expect("file");
    builder.file("/top", b"x").expect("file");
    builder.symlink("/docs/latest", "readme").expect("symlink");
    let fs = mount_plain(&builder, FilesystemOptions::default());

    let expected: Vec<(&str, Vec<&[u8]>)> = vec![
        ("/", vec![b"docs", b"top"]),
        ("/docs", vec![b"latest", b"old", b"readme", b"todo"]),
        ("/docs/old", vec![]),
    ];

    for (path, children) in expected {
        let ino = fs
            .metadata()
            .find_path(path)
            .expect("find_path")
            .expect("present");
        let entries = fs.readdir(ino, 0).expect("readdir");
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, children, "children of {path}");

        // Offset iteration yields each entry exactly once.
        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = fs.readdir(ino, offset).expect("readdir");
            let Some(entry) = page.first() else {
                break;
            };
            seen.push(entry.name.clone());
            offset = entry.next_offset;
        }
        assert_eq!(seen.len(), children.len(), "offset walk of {path}");
    }
}

#[test]
fn budget_holds_at_quiescence() {
    let mut builder = ImageBuilder::new(4).expect("builder");
    builder.file("/a", &vec![1_u8; 160]).expect("file");
    builder.file("/b", &vec![2_u8; 160]).expect("file");
    let fs = mount_plain(
        &builder,
        FilesystemOptions {
            cache_bytes: 3 * 16,
            ..FilesystemOptions::default()
        },
    );

    for name in [b"a", b"b"] {
        let ino = fs.lookup(fs.root(), name).expect("lookup").ino;
        let out = fs.open(ino, libc::O_RDONLY).expect("open");
        for offset in (0..160).step_by(16) {
            let _ = fs.read(out.fh, offset, 16).expect("read");
        }
        fs.release(out.fh);
    }

    let stats = fs.cache_stats();
    assert!(
        stats.resident_bytes <= stats.budget_bytes,
        "resident {} > budget {}",
        stats.resident_bytes,
        stats.budget_bytes
    );
    assert!(stats.evictions > 0);
}

#[test]
fn pinned_replies_keep_blocks_alive_under_pressure() {
    let mut builder = ImageBuilder::new(4).expect("builder");
    builder.file("/data", &vec![5_u8; 64]).expect("file");
    let (fs, source) = mount_counting(
        &builder,
        FilesystemOptions {
            cache_bytes: 16,
            ..FilesystemOptions::default()
        },
    );

    let ino = fs.lookup(fs.root(), b"data").expect("lookup").ino;
    let out = fs.open(ino, libc::O_RDONLY).expect("open");

    // Hold a reply (pinning block 0) while loading the other blocks.
    let pinned = fs.read(out.fh, 0, 16).expect("read");
    for block in 1..4_u64 {
        let _ = fs.read(out.fh, block * 16, 16).expect("read");
    }

    // Block 0 must not have been evicted while pinned.
    let loads = source.loads();
    let again = fs.read(out.fh, 0, 16).expect("read");
    assert_eq!(source.loads(), loads);
    assert_eq!(again.to_vec(), pinned.to_vec());

    // Dropping the replies releases the pins; pressure may now evict.
    drop(pinned);
    drop(again);
    fs.set_cache_budget(16);
    assert!(fs.cache_stats().resident_bytes <= 16);
}

#[test]
fn open_errno_mapping() {
    let mut builder = ImageBuilder::new(16).expect("builder");
    builder.dir("/d").expect("dir");
    builder.file("/f", b"x").expect("file");
    let fs = mount_plain(&builder, FilesystemOptions::default());

    let f = fs.lookup(fs.root(), b"f").expect("lookup").ino;
    for flags in [libc::O_WRONLY, libc::O_RDWR, libc::O_RDONLY | libc::O_TRUNC] {
        let err = fs.open(f, flags).unwrap_err();
        assert!(matches!(err, SfsError::AccessDenied));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    let d = fs.lookup(fs.root(), b"d").expect("lookup").ino;
    let err = fs.open(d, libc::O_RDONLY).unwrap_err();
    assert!(matches!(err, SfsError::IsDirectory));
    assert_eq!(err.to_errno(), libc::EISDIR);
}

// ── Codec and container coverage ────────────────────────────────────────────

#[test]
fn every_codec_round_trips() {
    let data: Vec<u8> = (0..5000_u32).map(|i| (i % 199) as u8).collect();
    for codec in [
        CodecTag::None,
        CodecTag::Zstd,
        CodecTag::Lzma,
        CodecTag::Lz4,
        CodecTag::Brotli,
    ] {
        let mut builder = ImageBuilder::new(10).expect("builder"); // 1 KiB blocks
        builder.codec(codec);
        builder.file("/blob", &data).expect("file");
        let fs = mount_plain(&builder, FilesystemOptions::default());
        assert_eq!(read_all(&fs, b"blob", 0, 5000), data, "codec {codec}");
    }
}

#[test]
fn embedded_image_mounts_with_auto_offset() {
    let mut builder = ImageBuilder::new(16).expect("builder");
    builder.prelude(b"#!/bin/sh\nexec stratafs \"$0\" \"$@\"\n");
    builder.file("/payload", b"embedded").expect("file");

    let fs = mount_plain(
        &builder,
        FilesystemOptions {
            image_offset: ImageOffset::Auto,
            ..FilesystemOptions::default()
        },
    );
    assert_eq!(read_all(&fs, b"payload", 0, 8), b"embedded");

    // Without the offset the magic is not at byte 0.
    let err = Filesystem::from_container(
        builder.build().expect("build"),
        FilesystemOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, SfsError::InvalidImage(_)));
}

#[test]
fn statvfs_and_xattrs_through_the_facade() {
    let mut builder = ImageBuilder::new(6).expect("builder");
    builder.file("/data", &vec![3_u8; 300]).expect("file");
    let fs = mount_plain(
        &builder,
        FilesystemOptions {
            read_only: true,
            ..FilesystemOptions::default()
        },
    );

    let stat = fs.statvfs().expect("statvfs");
    assert_eq!(stat.total_bytes, 300);
    assert_eq!(stat.blocks, 5);
    assert_eq!(stat.inodes, 2);
    assert!(stat.readonly);

    let ino = fs.lookup(fs.root(), b"data").expect("lookup").ino;
    let XattrReply::Data(value) = fs
        .getxattr(ino, sfs_core::XATTR_INODEINFO, 1 << 16)
        .expect("getxattr")
    else {
        panic!("expected data");
    };
    let info: serde_json::Value = serde_json::from_slice(&value).expect("json");
    assert_eq!(info["size"], 300);
    assert_eq!(info["chunks"].as_array().expect("chunks").len(), 5);
}
