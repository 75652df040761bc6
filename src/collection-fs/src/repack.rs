//! Repack planner and executor: merges under-full stored blocks into
//! fewer, fuller blocks and rewrites segment references atomically.

use crate::fs::CollectionFs;
use crate::segment::{Segment, StoredSegment};
use keep_lib::{
    strip_all_hints, BlockReadOptions, BlockSegment, BlockWriteOptions, KeepError, KeepResult,
    Locator,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default)]
pub struct RepackOptions {
    /// Consider every under-full block in the collection.
    pub full: bool,
    /// Only merge blocks the store already holds in a local cache.
    pub cached_only: bool,
}

impl CollectionFs {
    /// Merge under-full blocks and rewrite the tree to reference the
    /// merged copies. Returns the number of segment references rewritten
    /// (0 means the collection was already well packed).
    pub async fn repack(&self, ctx: &CancellationToken, opts: RepackOptions) -> KeepResult<usize> {
        let plan = self.plan_repack(ctx, &opts).await?;
        if plan.is_empty() {
            return Ok(0);
        }
        let mapping = self.repack_data(ctx, &plan).await?;
        let replaced = self.replace_segments_counted(&mapping).await?;
        debug!(
            "repack: {} group(s), {} segment reference(s) rewritten",
            plan.len(),
            replaced
        );
        Ok(replaced)
    }

    /// Propose groups of stored segments whose source blocks are under
    /// half full. Segments are walked depth-first with each directory's
    /// own files before its subdirectories, so sibling data stays
    /// adjacent in the merged blocks. Each group fits in one block and is
    /// only proposed when the merge result would itself be at least half
    /// full.
    pub async fn plan_repack(
        &self,
        ctx: &CancellationToken,
        opts: &RepackOptions,
    ) -> KeepResult<Vec<Vec<StoredSegment>>> {
        let max_block = self.max_block();
        let threshold = max_block / 2;

        let segments: Vec<StoredSegment> = {
            let tree = self.core.tree.read().await;
            let mut out = Vec::new();
            for id in tree.files_dfs(tree.root) {
                if let Ok(file) = tree.file(id) {
                    for seg in &file.segments {
                        if let Segment::Stored(s) = seg {
                            out.push(s.clone());
                        }
                    }
                }
            }
            out
        };

        let mut uncached: HashSet<String> = HashSet::new();
        if opts.cached_only {
            let mut checked: HashSet<String> = HashSet::new();
            for seg in &segments {
                if seg.size >= threshold {
                    continue;
                }
                let key = strip_all_hints(&seg.locator);
                if !checked.insert(key.clone()) {
                    continue;
                }
                let mut sink = tokio::io::sink();
                let probe = self
                    .core
                    .backend
                    .block_read(
                        ctx,
                        BlockReadOptions {
                            locator: seg.locator.clone(),
                            write_to: &mut sink,
                            cache_only: true,
                        },
                    )
                    .await;
                match probe {
                    Ok(_) => {}
                    Err(KeepError::NotCached(_)) => {
                        uncached.insert(key);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let mut plan: Vec<Vec<StoredSegment>> = Vec::new();
        let mut group: Vec<StoredSegment> = Vec::new();
        let mut group_blocks: HashSet<String> = HashSet::new();
        let mut group_len = 0u64;
        let mut planned_blocks: HashSet<String> = HashSet::new();

        let mut close_group =
            |group: &mut Vec<StoredSegment>, group_blocks: &mut HashSet<String>, group_len: &mut u64, plan: &mut Vec<Vec<StoredSegment>>, planned: &mut HashSet<String>| {
                if *group_len >= threshold && !group.is_empty() {
                    planned.extend(group_blocks.iter().cloned());
                    plan.push(std::mem::take(group));
                } else {
                    group.clear();
                }
                group_blocks.clear();
                *group_len = 0;
            };

        for seg in segments {
            if seg.size >= threshold {
                continue;
            }
            let key = strip_all_hints(&seg.locator);
            if uncached.contains(&key) || planned_blocks.contains(&key) {
                continue;
            }
            if group_blocks.contains(&key) {
                continue;
            }
            if group_len + seg.length > max_block {
                close_group(
                    &mut group,
                    &mut group_blocks,
                    &mut group_len,
                    &mut plan,
                    &mut planned_blocks,
                );
            }
            group_len += seg.length;
            group_blocks.insert(key);
            group.push(seg);
        }
        close_group(
            &mut group,
            &mut group_blocks,
            &mut group_len,
            &mut plan,
            &mut planned_blocks,
        );

        Ok(plan)
    }

    /// Execute a repack plan: fetch each distinct source block once, copy
    /// the live segment ranges into new blocks in group order, upload
    /// them, and return the old-range to new-range mapping.
    pub async fn repack_data(
        &self,
        ctx: &CancellationToken,
        plan: &[Vec<StoredSegment>],
    ) -> KeepResult<HashMap<BlockSegment, BlockSegment>> {
        let max_block = self.max_block();
        let mut mapping: HashMap<BlockSegment, BlockSegment> = HashMap::new();
        for group in plan {
            if group.is_empty() {
                continue;
            }
            let total: u64 = group.iter().map(|s| s.length).sum();
            if total > max_block {
                return Err(KeepError::InvalidArgument(format!(
                    "combined length {} would exceed maximum block size {}",
                    total, max_block
                )));
            }

            let mut blocks: HashMap<String, Arc<Vec<u8>>> = HashMap::new();
            for seg in group {
                let key = strip_all_hints(&seg.locator);
                if !blocks.contains_key(&key) {
                    let block = self.core.fetcher.read_block(ctx, &seg.locator).await?;
                    blocks.insert(key, block);
                }
            }

            let mut data = Vec::with_capacity(total as usize);
            let mut offsets = Vec::with_capacity(group.len());
            for seg in group {
                let block = &blocks[&strip_all_hints(&seg.locator)];
                offsets.push(data.len() as u64);
                data.extend_from_slice(
                    &block[seg.offset as usize..(seg.offset + seg.length) as usize],
                );
            }

            let resp = self
                .core
                .backend
                .block_write(
                    ctx,
                    BlockWriteOptions {
                        data,
                        storage_classes: self.core.config.storage_classes_desired.clone(),
                    },
                )
                .await?;

            for (seg, off) in group.iter().zip(offsets) {
                mapping.insert(
                    seg.block_segment().strip_all_hints(),
                    BlockSegment::new(resp.locator.clone(), off, seg.length),
                );
            }
        }
        Ok(mapping)
    }

    /// Rewrite every stored segment matching a mapping key to its mapped
    /// replacement, atomically under the tree lock. Mappings whose key is
    /// no longer referenced are skipped, along with every other mapping
    /// into the same replacement block (a merged block that would carry
    /// dead bytes is not worth referencing). Returns true if anything was
    /// rewritten.
    pub async fn replace_segments(
        &self,
        mapping: &HashMap<BlockSegment, BlockSegment>,
    ) -> KeepResult<bool> {
        Ok(self.replace_segments_counted(mapping).await? > 0)
    }

    pub(crate) async fn replace_segments_counted(
        &self,
        mapping: &HashMap<BlockSegment, BlockSegment>,
    ) -> KeepResult<usize> {
        // Normalize keys and validate every mapping before touching the
        // tree, so a bad mapping leaves it unchanged.
        let mut todo: HashMap<BlockSegment, &BlockSegment> = HashMap::new();
        for (key, repl) in mapping {
            let loc = Locator::parse(&repl.locator)?;
            if repl.offset + repl.length > loc.size() {
                return Err(KeepError::InvalidOffset(format!(
                    "offset {} + length {} > block size {}",
                    repl.offset,
                    repl.length,
                    loc.size()
                )));
            }
            if key.length != repl.length {
                return Err(KeepError::LengthMismatch(format!(
                    "replacing segment length {} with segment length {}",
                    key.length, repl.length
                )));
            }
            todo.insert(key.strip_all_hints(), repl);
        }

        let mut tree = self.core.tree.write().await;

        let mut referenced: HashSet<BlockSegment> = HashSet::new();
        tree.for_each_stored(|s| {
            referenced.insert(s.block_segment().strip_all_hints());
        });

        let mut skip_targets: HashSet<String> = HashSet::new();
        for (key, repl) in &todo {
            if !referenced.contains(key) {
                skip_targets.insert(strip_all_hints(&repl.locator));
            }
        }

        let mut replaced = 0usize;
        tree.for_each_stored_mut(|s| {
            let key = s.block_segment().strip_all_hints();
            if let Some(repl) = todo.get(&key) {
                if skip_targets.contains(&strip_all_hints(&repl.locator)) {
                    return;
                }
                let size = Locator::parse(&repl.locator).map(|l| l.size()).unwrap_or(0);
                s.locator = repl.locator.clone();
                s.size = size;
                s.offset = repl.offset;
                replaced += 1;
            }
        });
        Ok(replaced)
    }
}
