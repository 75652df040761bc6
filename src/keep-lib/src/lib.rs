mod locator;
mod sign;
mod block;
mod fetcher;
mod refresh;

pub use locator::*;
pub use sign::*;
pub use block::*;
pub use fetcher::*;
pub use refresh::*;

use thiserror::Error;

#[macro_use]
extern crate log;

/// Hard upper bound on the size of a single stored block.
pub const MAX_BLOCK_SIZE: u64 = 1 << 26;

/// Locator of the zero-length block, referenced by streams that carry
/// only empty files or directory markers.
pub const EMPTY_BLOCK_LOCATOR: &str = "d41d8cd98f00b204e9800998ecf8427e+0";

#[derive(Error, Debug)]
pub enum KeepError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("file does not exist")]
    NotExist,
    #[error("file already exists")]
    Exists,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("read-only file")]
    ReadOnlyFile,
    #[error("file is O_WRONLY")]
    WriteOnlyFile,
    #[error("invalid flag: {0:#o}")]
    InvalidFlag(u32),
    #[error("invalid locator: {0}")]
    BadLocator(String),
    #[error("invalid manifest: {0}")]
    BadManifest(String),
    #[error("block has a remote signature and no local replacement: {0}")]
    UnresolvedRemote(String),
    #[error("block signature is expired or invalid: {0}")]
    SignatureExpired(String),
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("block not in local cache: {0}")]
    NotCached(String),
    #[error("block store unavailable: {0}")]
    Unavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid replacement: {0}")]
    InvalidOffset(String),
    #[error("mismatched length: {0}")]
    LengthMismatch(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl KeepError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeepError::NotFound(_) | KeepError::NotExist)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, KeepError::Unavailable(_))
    }
}

pub type KeepResult<T> = std::result::Result<T, KeepError>;

impl From<std::io::Error> for KeepError {
    fn from(err: std::io::Error) -> Self {
        KeepError::IoError(err.to_string())
    }
}
