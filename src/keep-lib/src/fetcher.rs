use crate::{strip_all_hints, BlockReader, KeepError, KeepResult, Locator, MAX_BLOCK_SIZE};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Ranged reads larger than this are split into concurrently-fetched pieces.
pub const DEFAULT_FETCH_PIECE_SIZE: u64 = if MAX_BLOCK_SIZE < (1 << 25) {
    MAX_BLOCK_SIZE
} else {
    1 << 25
};

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(200);

const DEFAULT_CACHE_ENTRIES: usize = 128;
const DEFAULT_CACHE_BLOCK_MAX: u64 = 1 << 20;

#[derive(Clone)]
pub struct BlockFetcherOptions {
    pub piece_size: u64,
    pub cache_entries: usize,
    /// Blocks at most this large are kept whole in the LRU.
    pub cache_block_max: u64,
}

impl Default for BlockFetcherOptions {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_FETCH_PIECE_SIZE,
            cache_entries: DEFAULT_CACHE_ENTRIES,
            cache_block_max: DEFAULT_CACHE_BLOCK_MAX,
        }
    }
}

impl BlockFetcherOptions {
    pub fn with_piece_size(mut self, piece_size: u64) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    pub fn with_cache(mut self, entries: usize, block_max: u64) -> Self {
        self.cache_entries = entries;
        self.cache_block_max = block_max;
        self
    }
}

/// Signature-aware ranged reader over a `BlockReader`. Large ranges are
/// served by one worker per piece; transient store failures are retried
/// with linear back-off; small blocks are cached whole.
pub struct BlockFetcher {
    backend: Arc<dyn BlockReader>,
    piece_size: u64,
    cache_block_max: u64,
    cache: Mutex<LruCache<String, Arc<Vec<u8>>>>,
}

impl BlockFetcher {
    pub fn new(backend: Arc<dyn BlockReader>, options: BlockFetcherOptions) -> Self {
        let entries = NonZeroUsize::new(options.cache_entries.max(1)).unwrap();
        Self {
            backend,
            piece_size: options.piece_size.max(1),
            cache_block_max: options.cache_block_max,
            cache: Mutex::new(LruCache::new(entries)),
        }
    }

    /// Read `dst.len()` bytes (or up to end of block) starting at `offset`.
    /// Returns the number of bytes copied into `dst`.
    pub async fn read_range(
        &self,
        ctx: &CancellationToken,
        locator: &str,
        offset: u64,
        dst: &mut [u8],
    ) -> KeepResult<usize> {
        let loc = Locator::parse(locator)?;
        if offset > loc.size() {
            return Err(KeepError::InvalidArgument(format!(
                "read at {} beyond block size {}",
                offset,
                loc.size()
            )));
        }
        let want = (dst.len() as u64).min(loc.size() - offset) as usize;
        if want == 0 {
            return Ok(0);
        }
        let dst = &mut dst[..want];

        if loc.size() <= self.cache_block_max {
            let block = self.read_block(ctx, locator).await?;
            dst.copy_from_slice(&block[offset as usize..offset as usize + want]);
            return Ok(want);
        }

        if (want as u64) <= self.piece_size {
            self.read_piece(ctx, locator, offset, dst).await?;
            return Ok(want);
        }

        self.read_pieced(ctx, locator, offset, dst).await?;
        Ok(want)
    }

    /// Fetch a whole block, via the small-block LRU when it fits.
    pub async fn read_block(
        &self,
        ctx: &CancellationToken,
        locator: &str,
    ) -> KeepResult<Arc<Vec<u8>>> {
        let loc = Locator::parse(locator)?;
        let key = strip_all_hints(locator);
        let cacheable = loc.size() <= self.cache_block_max;
        if cacheable {
            if let Some(block) = self.cache.lock().unwrap().get(&key) {
                return Ok(block.clone());
            }
        }
        let mut buf = vec![0u8; loc.size() as usize];
        if (buf.len() as u64) <= self.piece_size {
            self.read_piece(ctx, locator, 0, &mut buf).await?;
        } else {
            self.read_pieced(ctx, locator, 0, &mut buf).await?;
        }
        let block = Arc::new(buf);
        if cacheable {
            self.cache.lock().unwrap().put(key, block.clone());
        }
        Ok(block)
    }

    /// One worker per piece; the first failure cancels the peers.
    async fn read_pieced(
        &self,
        ctx: &CancellationToken,
        locator: &str,
        offset: u64,
        dst: &mut [u8],
    ) -> KeepResult<()> {
        let npieces = (dst.len() as u64 + self.piece_size - 1) / self.piece_size;
        let child = ctx.child_token();
        let (tx, mut rx) = mpsc::channel::<(usize, KeepResult<Vec<u8>>)>(npieces as usize);
        for piece in 0..npieces {
            let start = piece * self.piece_size;
            let len = self.piece_size.min(dst.len() as u64 - start) as usize;
            let backend = self.backend.clone();
            let locator = locator.to_string();
            let token = child.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; len];
                let result = read_piece_retry(&*backend, &token, &locator, offset + start, &mut buf)
                    .await
                    .map(|_| buf);
                let _ = tx.send((piece as usize, result)).await;
            });
        }
        drop(tx);

        let mut received = 0u64;
        while received < npieces {
            let (piece, result) = match rx.recv().await {
                Some(msg) => msg,
                None => return Err(KeepError::Internal("piece worker vanished".to_string())),
            };
            match result {
                Ok(buf) => {
                    let start = piece * self.piece_size as usize;
                    dst[start..start + buf.len()].copy_from_slice(&buf);
                    received += 1;
                }
                Err(err) => {
                    child.cancel();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn read_piece(
        &self,
        ctx: &CancellationToken,
        locator: &str,
        offset: u64,
        dst: &mut [u8],
    ) -> KeepResult<()> {
        read_piece_retry(&*self.backend, ctx, locator, offset, dst).await
    }
}

async fn read_piece_retry(
    backend: &dyn BlockReader,
    ctx: &CancellationToken,
    locator: &str,
    offset: u64,
    dst: &mut [u8],
) -> KeepResult<()> {
    let mut attempt = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Err(KeepError::Cancelled);
        }
        attempt += 1;
        match read_piece_once(backend, ctx, locator, offset, dst).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < FETCH_ATTEMPTS => {
                warn!(
                    "transient failure reading {} at {} (attempt {}): {}",
                    locator, offset, attempt, err
                );
                tokio::select! {
                    _ = ctx.cancelled() => return Err(KeepError::Cancelled),
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY * attempt) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn read_piece_once(
    backend: &dyn BlockReader,
    ctx: &CancellationToken,
    locator: &str,
    offset: u64,
    dst: &mut [u8],
) -> KeepResult<()> {
    let mut filled = 0;
    while filled < dst.len() {
        let n = tokio::select! {
            _ = ctx.cancelled() => return Err(KeepError::Cancelled),
            r = backend.read_at(locator, &mut dst[filled..], offset + filled as u64) => r?,
        };
        if n == 0 {
            return Err(KeepError::IoError(format!(
                "short read of {} at offset {}",
                locator,
                offset + filled as u64
            )));
        }
        filled += n;
    }
    Ok(())
}
