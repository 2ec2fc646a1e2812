#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Magic bytes at the start of every StrataFS image.
pub const IMAGE_MAGIC: [u8; 8] = *b"STRATAFS";

/// Image format major version understood by this crate set.
pub const FORMAT_MAJOR: u16 = 1;

/// Total size of the fixed image header.
pub const IMAGE_HEADER_LEN: usize = 64;
/// Size of one block-index record.
pub const BLOCK_INDEX_RECORD_LEN: usize = 16;
/// Size of one metadata section descriptor.
pub const SECTION_DESC_LEN: usize = 20;
/// Size of one packed inode record.
pub const INODE_RECORD_LEN: usize = 40;
/// Size of one packed chunk record.
pub const CHUNK_RECORD_LEN: usize = 12;
/// Size of one packed directory-entry record.
pub const DIRENT_RECORD_LEN: usize = 12;
/// Size of one packed symlink record.
pub const SYMLINK_RECORD_LEN: usize = 8;

/// Identifier of a compressed data block within an image.
///
/// Block ids are assigned densely at image-build time; the set of valid
/// ids is `0..num_blocks` for the life of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Index of an inode record in the packed inode table (0 = root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeIndex(pub u32);

/// Inode number as exposed to the host driver.
///
/// This is the table index shifted by the configured inode offset
/// (the FUSE root id). Use [`InodeIndex::to_public`] and
/// [`InodeNum::to_index`] to convert; the distinction prevents mixing
/// table positions with driver-visible numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNum(pub u64);

impl InodeIndex {
    pub const ROOT: Self = Self(0);

    /// Shift to the driver-visible inode number.
    #[must_use]
    pub fn to_public(self, inode_offset: u64) -> InodeNum {
        InodeNum(u64::from(self.0) + inode_offset)
    }
}

impl InodeNum {
    /// Translate back to a table index, or `None` if the number lies
    /// below the configured offset.
    #[must_use]
    pub fn to_index(self, inode_offset: u64) -> Option<InodeIndex> {
        let idx = self.0.checked_sub(inode_offset)?;
        u32::try_from(idx).ok().map(InodeIndex)
    }
}

/// Byte offset within the image or within a decompressed block space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

/// Validated block-size exponent (block size = `1 << exp`).
///
/// Production images use large blocks (hundreds of KiB); the format
/// itself only requires a power of two up to 256 MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSizeExp(u8);

impl BlockSizeExp {
    /// Create a `BlockSizeExp` if `exp` is in [4, 28].
    pub fn new(exp: u8) -> Result<Self, ParseError> {
        if !(4..=28).contains(&exp) {
            return Err(ParseError::InvalidField {
                field: "block_size_exp",
                reason: "must be in 4..=28",
            });
        }
        Ok(Self(exp))
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Decompressed block size in bytes.
    #[must_use]
    pub fn block_size(self) -> u32 {
        1_u32 << self.0
    }

    /// Block id containing a byte of the decompressed data space.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // shifted down below u32::MAX blocks
    pub fn byte_to_block(self, byte_offset: u64) -> BlockId {
        BlockId((byte_offset >> u64::from(self.0)) as u32)
    }
}

/// Codec used to compress a block, stored per block in the block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecTag {
    None,
    Zstd,
    Lzma,
    Lz4,
    Brotli,
}

impl CodecTag {
    /// Decode the on-disk codec byte. Unknown values are preserved in
    /// the error so the caller can report them.
    pub fn from_raw(raw: u8) -> Result<Self, u8> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Zstd),
            2 => Ok(Self::Lzma),
            3 => Ok(Self::Lz4),
            4 => Ok(Self::Brotli),
            other => Err(other),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
            Self::Lzma => 2,
            Self::Lz4 => 3,
            Self::Brotli => 4,
        }
    }
}

impl fmt::Display for CodecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Zstd => "zstd",
            Self::Lzma => "lzma",
            Self::Lz4 => "lz4",
            Self::Brotli => "brotli",
        };
        write!(f, "{name}")
    }
}

// ── Runtime option enums ────────────────────────────────────────────────────

/// Page-locking mode for the mapped image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlockMode {
    #[default]
    None,
    /// Lock if possible; log and continue on failure.
    Try,
    /// Lock or fail the mount.
    Must,
}

impl FromStr for MlockMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        match s {
            "none" => Ok(Self::None),
            "try" => Ok(Self::Try),
            "must" => Ok(Self::Must),
            _ => Err(ParseError::InvalidField {
                field: "mlock",
                reason: "expected none, try or must",
            }),
        }
    }
}

/// Periodic cache tidy strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TidyStrategy {
    #[default]
    None,
    /// Evict entries whose last access is older than the max age.
    ExpiryTime,
    /// Evict entries whose buffers the kernel has swapped out.
    BlockSwappedOut,
}

impl FromStr for TidyStrategy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        match s {
            "none" => Ok(Self::None),
            "time" => Ok(Self::ExpiryTime),
            "swap" => Ok(Self::BlockSwappedOut),
            _ => Err(ParseError::InvalidField {
                field: "tidy_strategy",
                reason: "expected none, time or swap",
            }),
        }
    }
}

/// Tidy timer configuration, applied via the cache at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TidyConfig {
    pub strategy: TidyStrategy,
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for TidyConfig {
    fn default() -> Self {
        Self {
            strategy: TidyStrategy::None,
            interval: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(10 * 60),
        }
    }
}

/// Byte offset of the image within its container file.
///
/// `Auto` scans the container for the image magic; used for images
/// appended behind a shell-script prelude.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageOffset {
    #[default]
    Start,
    Explicit(u64),
    Auto,
}

impl FromStr for ImageOffset {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        if s == "auto" {
            return Ok(Self::Auto);
        }
        match s.parse::<u64>() {
            Ok(0) => Ok(Self::Start),
            Ok(n) => Ok(Self::Explicit(n)),
            Err(_) => Err(ParseError::InvalidField {
                field: "image_offset",
                reason: "expected a byte offset or `auto`",
            }),
        }
    }
}

// ── File kinds and mode constants ───────────────────────────────────────────

/// File type mask (upper bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

/// Access check bits as passed by the host driver.
pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;

/// File type of an inode, derived from its mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Derive the kind from full mode bits; `None` for unknown types.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }
}

// ── Parsing primitives ──────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic")]
    InvalidMagic,
    #[error("unsupported format version {major}.{minor}.{patch}")]
    UnsupportedVersion { major: u16, minor: u16, patch: u16 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Option-string parsing ───────────────────────────────────────────────────

/// Parse a byte size with an optional binary unit suffix
/// (`k`/`K`, `m`/`M`, `g`/`G`, `t`/`T`).
pub fn parse_size_with_unit(s: &str) -> Result<u64, ParseError> {
    let s = s.trim();
    let invalid = ParseError::InvalidField {
        field: "size",
        reason: "expected digits with optional K/M/G/T suffix",
    };

    let (digits, shift) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 10),
        Some('m' | 'M') => (&s[..s.len() - 1], 20),
        Some('g' | 'G') => (&s[..s.len() - 1], 30),
        Some('t' | 'T') => (&s[..s.len() - 1], 40),
        Some(c) if c.is_ascii_digit() => (s, 0),
        _ => return Err(invalid),
    };

    let value: u64 = digits.parse().map_err(|_| invalid.clone())?;
    value.checked_shl(shift).filter(|v| v >> shift == value).ok_or(invalid)
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSizeExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.block_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(read_le_u64(&bytes, 4).is_err());
    }

    #[test]
    fn block_size_exp_validation() {
        assert!(BlockSizeExp::new(3).is_err());
        assert!(BlockSizeExp::new(29).is_err());
        assert_eq!(BlockSizeExp::new(4).expect("min exp").block_size(), 16);
        let exp = BlockSizeExp::new(19).expect("valid exp");
        assert_eq!(exp.block_size(), 512 * 1024);
        assert_eq!(exp.byte_to_block(0), BlockId(0));
        assert_eq!(exp.byte_to_block(512 * 1024), BlockId(1));
        assert_eq!(exp.byte_to_block(512 * 1024 - 1), BlockId(0));
    }

    #[test]
    fn codec_tag_round_trip() {
        for tag in [
            CodecTag::None,
            CodecTag::Zstd,
            CodecTag::Lzma,
            CodecTag::Lz4,
            CodecTag::Brotli,
        ] {
            assert_eq!(CodecTag::from_raw(tag.to_raw()), Ok(tag));
        }
        assert_eq!(CodecTag::from_raw(17), Err(17));
    }

    #[test]
    fn inode_number_translation() {
        let idx = InodeIndex(5);
        let num = idx.to_public(1);
        assert_eq!(num, InodeNum(6));
        assert_eq!(num.to_index(1), Some(idx));
        assert_eq!(InodeNum(0).to_index(1), None);
        assert_eq!(InodeIndex::ROOT.to_public(1), InodeNum(1));
    }

    #[test]
    fn file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFREG | 0o644), Some(FileKind::Regular));
        assert_eq!(FileKind::from_mode(S_IFDIR | 0o755), Some(FileKind::Directory));
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), Some(FileKind::Symlink));
        assert_eq!(FileKind::from_mode(S_IFSOCK), Some(FileKind::Socket));
        assert_eq!(FileKind::from_mode(0o644), None);
    }

    #[test]
    fn size_with_unit() {
        assert_eq!(parse_size_with_unit("512").expect("plain"), 512);
        assert_eq!(parse_size_with_unit("512K").expect("kib"), 512 << 10);
        assert_eq!(parse_size_with_unit("512m").expect("mib"), 512 << 20);
        assert_eq!(parse_size_with_unit("2G").expect("gib"), 2 << 30);
        assert!(parse_size_with_unit("").is_err());
        assert!(parse_size_with_unit("12Q").is_err());
        assert!(parse_size_with_unit("M").is_err());
        assert!(parse_size_with_unit("99999999999999999999T").is_err());
    }

    #[test]
    fn option_enum_parsing() {
        assert_eq!("try".parse::<MlockMode>(), Ok(MlockMode::Try));
        assert!("hard".parse::<MlockMode>().is_err());
        assert_eq!("swap".parse::<TidyStrategy>(), Ok(TidyStrategy::BlockSwappedOut));
        assert_eq!("auto".parse::<ImageOffset>(), Ok(ImageOffset::Auto));
        assert_eq!("4096".parse::<ImageOffset>(), Ok(ImageOffset::Explicit(4096)));
        assert_eq!("0".parse::<ImageOffset>(), Ok(ImageOffset::Start));
        assert!("later".parse::<ImageOffset>().is_err());
    }
}
