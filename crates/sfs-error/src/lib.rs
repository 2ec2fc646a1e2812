#![forbid(unsafe_code)]
//! Error types for StrataFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE response codes.

use sfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all StrataFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("no such entry")]
    NoEntry,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("access denied")]
    AccessDenied,

    #[error("no such attribute")]
    NoAttr,

    #[error("buffer too small")]
    Range,

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("corrupt block {block}: {detail}")]
    CorruptBlock { block: u64, detail: String },

    #[error("unsupported codec tag {0}")]
    UnsupportedCodec(u8),

    #[error("operation cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

impl SfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// Decode failures (`CorruptBlock`, `UnsupportedCodec`) surface as
    /// `EIO` at the driver boundary; the cache retries them on the next
    /// request.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoEntry => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::AccessDenied => libc::EACCES,
            Self::NoAttr => errno_no_attr(),
            Self::Range => libc::ERANGE,
            Self::BadHandle(_) => libc::EBADF,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidImage(_) | Self::CorruptBlock { .. } | Self::UnsupportedCodec(_) => {
                libc::EIO
            }
            Self::Cancelled => libc::ECANCELED,
            Self::ResourceExhausted(_) => libc::ENOMEM,
        }
    }

    /// True for the errors a lookup miss produces (used to suppress
    /// warning logs on expected paths).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoEntry | Self::NoAttr)
    }
}

/// Errno for "extended attribute not found".
///
/// Linux and macOS disagree on the value.
#[must_use]
pub fn errno_no_attr() -> libc::c_int {
    #[cfg(target_os = "macos")]
    {
        libc::ENOATTR
    }
    #[cfg(not(target_os = "macos"))]
    {
        libc::ENODATA
    }
}

impl From<ParseError> for SfsError {
    fn from(err: ParseError) -> Self {
        Self::InvalidImage(err.to_string())
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
