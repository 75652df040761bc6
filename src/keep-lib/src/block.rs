use crate::{strip_all_hints, KeepResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// A byte range inside one stored block, addressed by locator. Used as the
/// key/value pair when segment references are rewritten after a repack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockSegment {
    pub locator: String,
    pub offset: u64,
    pub length: u64,
}

impl BlockSegment {
    pub fn new(locator: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            locator: locator.into(),
            offset,
            length,
        }
    }

    /// Copy with the locator reduced to its `hash+size` form.
    pub fn strip_all_hints(&self) -> BlockSegment {
        BlockSegment {
            locator: strip_all_hints(&self.locator),
            offset: self.offset,
            length: self.length,
        }
    }
}

pub struct BlockReadOptions<'a> {
    pub locator: String,
    pub write_to: &'a mut (dyn AsyncWrite + Unpin + Send),
    /// When set, fail with `NotCached` instead of touching the network if
    /// the block is absent from every local cache layer.
    pub cache_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BlockWriteOptions {
    pub data: Vec<u8>,
    pub storage_classes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWriteResponse {
    pub locator: String,
    pub replicas: u32,
}

/// Read access to the block store.
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Copy block bytes starting at `offset` into `buf`. Short reads are
    /// allowed; n == 0 at a valid offset means the store had nothing more.
    async fn read_at(&self, locator: &str, buf: &mut [u8], offset: u64) -> KeepResult<usize>;

    /// Stream a whole block into `opts.write_to`.
    async fn block_read(
        &self,
        ctx: &CancellationToken,
        opts: BlockReadOptions<'_>,
    ) -> KeepResult<usize>;
}

/// Write access to the block store. The store computes the content hash
/// and returns a signed locator.
#[async_trait]
pub trait BlockWriter: Send + Sync {
    async fn block_write(
        &self,
        ctx: &CancellationToken,
        opts: BlockWriteOptions,
    ) -> KeepResult<BlockWriteResponse>;
}

/// Converts a locator that is only valid remotely (`+R` hint) into one
/// signed for local use, and reissues stale local signatures.
#[async_trait]
pub trait LocatorResolver: Send + Sync {
    async fn local_locator(&self, locator: &str) -> KeepResult<String>;
}

/// The ambient handle a collection filesystem holds on its block store.
pub trait KeepBackend: BlockReader + BlockWriter + LocatorResolver {}

impl<T: BlockReader + BlockWriter + LocatorResolver + ?Sized> KeepBackend for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_segment_strip() {
        let seg = BlockSegment::new("acbd18db4cc2f85cedef654fccc4a4d8+3+A1234@5678", 1, 2);
        let stripped = seg.strip_all_hints();
        assert_eq!(stripped.locator, "acbd18db4cc2f85cedef654fccc4a4d8+3");
        assert_eq!((stripped.offset, stripped.length), (1, 2));
    }
}
