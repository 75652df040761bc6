//! Flush/pack engine: turns runs of buffered memory segments into stored
//! blocks, bounded by the filesystem's writer semaphore.
//!
//! Two shapes of work:
//! - full-block carving: any run of memory segments totalling at least
//!   `max_block_size` is cut into exact-size blocks, one upload each;
//! - short-block packing: on a non-full flush, the leftover memory
//!   segments of one directory's files are packed together into shared
//!   blocks, walking files in name order.
//!
//! Upload tasks never hold the tree lock. Each job copies its bytes out
//! under the lock, uploads, then re-finds its source segments by identity;
//! a segment that was mutated meanwhile is simply left alone.

use crate::fs::{CollectionFs, FsCore};
use crate::node::{normalize_path, FileNode, FsTree, Node, NodeId};
use crate::segment::{SegIdent, Segment, StoredSegment};
use futures_util::future::join_all;
use keep_lib::{strip_all_hints, BlockWriteOptions, KeepError, KeepResult, Locator};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) struct FlushJob {
    pub data: Vec<u8>,
    pub parts: Vec<JobPart>,
}

pub(crate) struct JobPart {
    pub file: NodeId,
    pub ident: SegIdent,
    pub block_off: u64,
    pub len: u64,
}

fn free_mem(seg: &Segment) -> bool {
    matches!(seg, Segment::Memory(m) if !m.flushing)
}

/// Cut every memory run of `file` that reaches `max_block` into
/// exact-size upload jobs, splitting boundary segments in place. Involved
/// segments are marked flushing.
pub(crate) fn carve_full_jobs(
    file_id: NodeId,
    file: &mut FileNode,
    max_block: u64,
) -> Vec<FlushJob> {
    let mut jobs = Vec::new();
    let mut i = 0;
    while i < file.segments.len() {
        if !free_mem(&file.segments[i]) {
            i += 1;
            continue;
        }
        let mut j = i;
        let mut total = 0u64;
        while j < file.segments.len() && free_mem(&file.segments[j]) {
            total += file.segments[j].len();
            j += 1;
        }
        if total < max_block {
            i = j;
            continue;
        }
        let mut start = i;
        let mut idx = i;
        let mut acc = 0u64;
        while total >= max_block {
            let l = file.segments[idx].len();
            if acc + l < max_block {
                acc += l;
                idx += 1;
                continue;
            }
            if acc + l > max_block {
                let (a, b) = file.segments[idx].split(max_block - acc);
                file.segments[idx] = a;
                file.segments.insert(idx + 1, b);
                j += 1;
            }
            jobs.push(make_job(file_id, file, start, idx + 1));
            total -= max_block;
            start = idx + 1;
            idx = start;
            acc = 0;
        }
        i = j;
    }
    jobs
}

fn make_job(file_id: NodeId, file: &mut FileNode, start: usize, end: usize) -> FlushJob {
    let mut data = Vec::new();
    let mut parts = Vec::new();
    for seg in &mut file.segments[start..end] {
        if let Segment::Memory(m) = seg {
            parts.push(JobPart {
                file: file_id,
                ident: m.ident(),
                block_off: data.len() as u64,
                len: m.len as u64,
            });
            data.extend_from_slice(m.bytes());
            m.flushing = true;
        }
    }
    FlushJob { data, parts }
}

/// Pack the remaining (short) memory segments of one directory's files
/// into shared blocks, cutting before a block would overflow.
pub(crate) fn plan_pack_jobs(tree: &mut FsTree, dir_id: NodeId, max_block: u64) -> Vec<FlushJob> {
    let mut jobs = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut parts: Vec<JobPart> = Vec::new();
    for fid in tree.dir_files(dir_id) {
        let file = match tree.get_mut(fid) {
            Some(Node::File(f)) => f,
            _ => continue,
        };
        for seg in &mut file.segments {
            if let Segment::Memory(m) = seg {
                if m.flushing || m.len == 0 {
                    continue;
                }
                if !data.is_empty() && data.len() as u64 + m.len as u64 > max_block {
                    jobs.push(FlushJob {
                        data: std::mem::take(&mut data),
                        parts: std::mem::take(&mut parts),
                    });
                }
                parts.push(JobPart {
                    file: fid,
                    ident: m.ident(),
                    block_off: data.len() as u64,
                    len: m.len as u64,
                });
                data.extend_from_slice(m.bytes());
                m.flushing = true;
            }
        }
    }
    if !data.is_empty() {
        jobs.push(FlushJob { data, parts });
    }
    jobs
}

/// Upload one job and splice the result into the tree. The semaphore
/// bounds concurrent uploads; the tree lock is only taken after the
/// upload finishes.
pub(crate) async fn run_job(
    core: &Arc<FsCore>,
    ctx: &CancellationToken,
    job: FlushJob,
) -> KeepResult<()> {
    let FlushJob { data, parts } = job;
    let block_size = data.len() as u64;
    let result = async {
        let _permit = core
            .write_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KeepError::Internal("writer pool closed".into()))?;
        let opts = BlockWriteOptions {
            data,
            storage_classes: core.config.storage_classes_desired.clone(),
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(KeepError::Cancelled),
            r = core.backend.block_write(ctx, opts) => r,
        }
    }
    .await;

    let mut tree = core.tree.write().await;
    match result {
        Ok(resp) => {
            apply_parts(&mut tree, &parts, &resp.locator, block_size);
            Ok(())
        }
        Err(err) => {
            clear_parts(&mut tree, &parts);
            Err(err)
        }
    }
}

fn apply_parts(tree: &mut FsTree, parts: &[JobPart], locator: &str, block_size: u64) {
    for part in parts {
        let file = match tree.get_mut(part.file) {
            Some(Node::File(f)) => f,
            _ => continue,
        };
        let found = file.segments.iter().position(
            |seg| matches!(seg, Segment::Memory(m) if m.flushing && m.ident() == part.ident),
        );
        match found {
            Some(idx) => {
                file.segments[idx] = Segment::Stored(StoredSegment {
                    locator: locator.to_string(),
                    size: block_size,
                    offset: part.block_off,
                    length: part.len,
                });
                file.recount_memsize();
            }
            None => {
                // Mutated while the upload was in flight; its bytes stay
                // in memory and the uploaded copy goes unreferenced.
                debug!("flushed segment no longer present; skipping splice");
            }
        }
    }
}

fn clear_parts(tree: &mut FsTree, parts: &[JobPart]) {
    for part in parts {
        if let Some(Node::File(file)) = tree.get_mut(part.file) {
            for seg in &mut file.segments {
                if let Segment::Memory(m) = seg {
                    if m.flushing && m.ident() == part.ident {
                        m.flushing = false;
                    }
                }
            }
        }
    }
}

fn tree_has_memory(tree: &FsTree) -> bool {
    tree.files_dfs(tree.root).into_iter().any(|id| {
        tree.file(id)
            .map(|f| f.segments.iter().any(|s| s.is_memory()))
            .unwrap_or(false)
    })
}

impl CollectionFs {
    /// Fire-and-forget upload of already-planned jobs; used by the write
    /// path when a file's buffered data reaches a full block.
    pub(crate) fn spawn_prune(&self, job: FlushJob) {
        let fs = self.clone();
        let file_id = job.parts.first().map(|p| p.file);
        tokio::spawn(async move {
            let ctx = fs.core.cancel.clone();
            if let Err(err) = run_job(&fs.core, &ctx, job).await {
                warn!("background block flush failed: {}", err);
            }
            if let Some(id) = file_id {
                let mut tree = fs.core.tree.write().await;
                if let Some(Node::File(f)) = tree.get_mut(id) {
                    f.pruning = f.pruning.saturating_sub(1);
                }
            }
            fs.core.prunes.fetch_sub(1, Ordering::SeqCst);
            fs.core.prune_notify.notify_waiters();
        });
    }

    /// Flush buffered writes under `path` to the block store. An empty
    /// path walks the whole tree; anything else flushes only that
    /// directory's own files. With `non_full` set, trailing short blocks
    /// are packed and written too; otherwise only full blocks go out.
    pub async fn flush(&self, path: &str, non_full: bool, ctx: &CancellationToken) -> KeepResult<()> {
        let jobs = {
            let mut tree = self.core.tree.write().await;
            let dir_ids = if path.is_empty() {
                tree.dirs_recursive(tree.root)
            } else {
                let id = tree.resolve(&normalize_path(path))?;
                tree.dir(id)?;
                vec![id]
            };
            let max_block = self.max_block();
            let mut jobs = Vec::new();
            for &dir_id in &dir_ids {
                for fid in tree.dir_files(dir_id) {
                    if let Some(Node::File(file)) = tree.get_mut(fid) {
                        jobs.extend(carve_full_jobs(fid, file, max_block));
                    }
                }
                if non_full {
                    jobs.extend(plan_pack_jobs(&mut tree, dir_id, max_block));
                }
            }
            jobs
        };
        if jobs.is_empty() {
            return Ok(());
        }
        debug!("flushing {} block(s)", jobs.len());
        let results = join_all(jobs.into_iter().map(|job| run_job(&self.core, ctx, job))).await;
        results.into_iter().collect::<KeepResult<Vec<()>>>()?;
        Ok(())
    }

    /// Flush everything, resolve remote locator hints, and serialize the
    /// canonical manifest. Every write that completed before this call is
    /// reflected in the result.
    pub async fn marshal_manifest(&self, ctx: &CancellationToken) -> KeepResult<String> {
        loop {
            if ctx.is_cancelled() {
                return Err(KeepError::Cancelled);
            }
            self.flush("", true, ctx).await?;
            self.wait_prune().await;
            self.resolve_remote_locators().await?;
            {
                let tree = self.core.tree.read().await;
                if !tree_has_memory(&tree) {
                    return crate::manifest::emit_manifest(&tree);
                }
            }
            // Writes raced in while uploads were in flight; flush again.
        }
    }

    async fn resolve_remote_locators(&self) -> KeepResult<()> {
        let remotes: Vec<String> = {
            let tree = self.core.tree.read().await;
            let mut seen = HashMap::new();
            tree.for_each_stored(|s| {
                if let Ok(loc) = Locator::parse(&s.locator) {
                    if loc.is_remote() {
                        seen.entry(loc.stripped()).or_insert_with(|| s.locator.clone());
                    }
                }
            });
            seen.into_values().collect()
        };
        if remotes.is_empty() {
            return Ok(());
        }
        let mut map = HashMap::new();
        for loc in remotes {
            let local = self
                .core
                .backend
                .local_locator(&loc)
                .await
                .map_err(|err| KeepError::UnresolvedRemote(format!("{}: {}", loc, err)))?;
            map.insert(strip_all_hints(&loc), local);
        }
        let mut tree = self.core.tree.write().await;
        tree.for_each_stored_mut(|s| {
            if let Some(local) = map.get(&strip_all_hints(&s.locator)) {
                let remote = Locator::parse(&s.locator)
                    .map(|l| l.is_remote())
                    .unwrap_or(false);
                if remote {
                    s.locator = local.clone();
                }
            }
        });
        Ok(())
    }
}
