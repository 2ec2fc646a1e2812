#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sfs_block::{ImageMap, ImageMapOptions};
use sfs_core::{Filesystem, FilesystemOptions, FsOps};
use sfs_fuse::{InitSettings, MountOptions};
use sfs_types::{
    parse_size_with_unit, ImageOffset, MlockMode, ParseError, TidyConfig, TidyStrategy,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_size(s: &str) -> Result<u64, ParseError> {
    parse_size_with_unit(s)
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "stratafs", about = "StrataFS — read-only archival filesystem")]
struct Cli {
    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "warn")]
    debuglevel: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount an image via FUSE (read-only).
    Mount {
        /// Path to the image file.
        image: PathBuf,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Size of the block cache (e.g. 512M).
        #[arg(long, default_value = "512M", value_parser = parse_size)]
        cachesize: u64,
        /// File I/O block size hint (e.g. 512K).
        #[arg(long, default_value = "512K", value_parser = parse_size)]
        blocksize: u64,
        /// Readahead size; 0 disables readahead.
        #[arg(long, default_value = "0", value_parser = parse_size)]
        readahead: u64,
        /// Number of worker threads.
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Page locking mode: none, try or must.
        #[arg(long, default_value = "none")]
        mlock: MlockMode,
        /// Ratio for full decompression.
        #[arg(long, default_value_t = 0.8)]
        decratio: f64,
        /// Image offset in bytes, or `auto` to scan for it.
        #[arg(long, default_value = "0")]
        offset: ImageOffset,
        /// Cache tidy strategy: none, time or swap.
        #[arg(long, default_value = "none")]
        tidy_strategy: TidyStrategy,
        /// Interval between tidy passes.
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        tidy_interval: Duration,
        /// Tidy blocks not accessed for this long.
        #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
        tidy_max_age: Duration,
        /// Sequential access detector threshold; 0 disables it.
        #[arg(long, default_value_t = 4)]
        seq_detector: usize,
        /// Show correct hardlink counts.
        #[arg(long)]
        enable_nlink: bool,
        /// Advertise a read-only file system through statvfs.
        #[arg(long)]
        readonly: bool,
        /// Keep the compressed image in the kernel page cache.
        #[arg(long)]
        cache_image: bool,
        /// Don't let the kernel cache decompressed file data.
        #[arg(long)]
        no_cache_files: bool,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
        /// Serve live cache statistics through the perfmon xattr.
        #[arg(long)]
        perfmon: bool,
    },
    /// Inspect an image without mounting it.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Image offset in bytes, or `auto` to scan for it.
        #[arg(long, default_value = "0")]
        offset: ImageOffset,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    version: String,
    block_size: u32,
    blocks: u32,
    metadata_bytes: u64,
    inodes: u64,
    total_bytes: u64,
    has_symlinks: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.debuglevel))
        .context("invalid debug level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Mount {
            image,
            mountpoint,
            cachesize,
            blocksize,
            readahead,
            workers,
            mlock,
            decratio,
            offset,
            tidy_strategy,
            tidy_interval,
            tidy_max_age,
            seq_detector,
            enable_nlink,
            readonly,
            cache_image,
            no_cache_files,
            allow_other,
            perfmon,
        } => {
            let tidy = TidyConfig {
                strategy: tidy_strategy,
                interval: tidy_interval,
                max_age: tidy_max_age,
            };
            let options = FilesystemOptions {
                cache_bytes: cachesize,
                block_size: u32::try_from(blocksize)
                    .context("blocksize does not fit in 32 bits")?,
                readahead_bytes: readahead,
                workers,
                page_lock: mlock,
                decompress_ratio: decratio,
                image_offset: offset,
                // Applied from the driver's init callback, after the
                // session is up; the constructor leaves workers and
                // the tidy timer alone.
                tidy: TidyConfig::default(),
                init_workers: false,
                seq_detector_threshold: seq_detector,
                enable_nlink,
                read_only: readonly,
                cache_image,
                cache_files: !no_cache_files,
                inode_offset: 1,
                enable_perfmon: perfmon,
            };

            let fs = Filesystem::open_path(&image, options)
                .with_context(|| format!("failed to load filesystem from {}", image.display()))?;
            info!(
                target: "sfs::cli",
                event = "mounting",
                image = %image.display(),
                mountpoint = %mountpoint.display()
            );

            sfs_fuse::mount(
                Box::new(fs) as Box<dyn FsOps>,
                InitSettings::new(workers, tidy),
                &mountpoint,
                &MountOptions {
                    read_only: true,
                    allow_other,
                    auto_unmount: true,
                },
            )
            .context("mount failed")?;
            Ok(())
        }
        Command::Inspect {
            image,
            offset,
            json,
        } => {
            let map = ImageMap::open(
                &image,
                &ImageMapOptions {
                    offset,
                    mlock: MlockMode::None,
                    cache_image: false,
                },
            )
            .with_context(|| format!("failed to open image {}", image.display()))?;

            let meta = sfs_metadata::MetadataView::new(
                std::sync::Arc::clone(&map),
                sfs_metadata::MetadataOptions::default(),
            )
            .context("failed to parse image metadata")?;
            let header = map.header();
            let stat = meta.statvfs();
            let output = InspectOutput {
                version: format!(
                    "{}.{}.{}",
                    header.version.0, header.version.1, header.version.2
                ),
                block_size: header.block_size.block_size(),
                blocks: header.num_blocks(),
                metadata_bytes: header.metadata_len,
                inodes: stat.inodes,
                total_bytes: stat.total_bytes,
                has_symlinks: meta.has_symlinks(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("image version:  {}", output.version);
                println!("block size:     {}", output.block_size);
                println!("blocks:         {}", output.blocks);
                println!("metadata bytes: {}", output.metadata_bytes);
                println!("inodes:         {}", output.inodes);
                println!("total bytes:    {}", output.total_bytes);
                println!("has symlinks:   {}", output.has_symlinks);
            }
            Ok(())
        }
    }
}
