use crate::node::{normalize_path, DirNode, FileNode, FsTree, Node, NodeId};
use crate::segment::{MemSegment, Segment};
use crate::CollectionFsConfig;
use keep_lib::{
    signature_expiry_time, strip_all_hints, BlockFetcher, BlockFetcherOptions, KeepBackend,
    KeepError, KeepResult, Locator, RefreshAction, SignatureRefresher,
};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;
pub const O_CREATE: u32 = 0o100;
pub const O_EXCL: u32 = 0o200;
pub const O_TRUNC: u32 = 0o1000;
pub const O_APPEND: u32 = 0o2000;

const O_ACCMODE: u32 = 0o3;
const O_SUPPORTED: u32 = O_ACCMODE | O_CREATE | O_EXCL | O_TRUNC | O_APPEND;

#[derive(Debug, Clone, Copy)]
struct OpenMode {
    readable: bool,
    writable: bool,
    append: bool,
    create: bool,
    excl: bool,
    trunc: bool,
}

fn parse_flags(flags: u32) -> KeepResult<OpenMode> {
    if flags & !O_SUPPORTED != 0 {
        return Err(KeepError::InvalidFlag(flags));
    }
    let (readable, writable) = match flags & O_ACCMODE {
        O_RDONLY => (true, false),
        O_WRONLY => (false, true),
        O_RDWR => (true, true),
        _ => return Err(KeepError::InvalidFlag(flags)),
    };
    let mode = OpenMode {
        readable,
        writable,
        append: flags & O_APPEND != 0,
        create: flags & O_CREATE != 0,
        excl: flags & O_EXCL != 0,
        trunc: flags & O_TRUNC != 0,
    };
    if mode.trunc && !mode.writable {
        return Err(KeepError::InvalidArgument(
            "O_TRUNC requires write access".into(),
        ));
    }
    Ok(mode)
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mtime: SystemTime,
}

pub(crate) struct FsCore {
    pub tree: RwLock<FsTree>,
    pub backend: Arc<dyn KeepBackend>,
    pub fetcher: BlockFetcher,
    pub config: CollectionFsConfig,
    pub refresher: SignatureRefresher,
    pub refresh_inflight: AtomicBool,
    pub write_sem: Arc<Semaphore>,
    /// In-flight background flush tasks across the whole filesystem.
    pub prunes: AtomicU32,
    pub prune_notify: Notify,
    pub cancel: CancellationToken,
}

/// A collection filesystem: an in-memory file tree whose file contents
/// live partly in stored blocks and partly in write buffers, defined by
/// and reserializable to a manifest.
#[derive(Clone)]
pub struct CollectionFs {
    pub(crate) core: Arc<FsCore>,
}

impl CollectionFs {
    /// An empty collection.
    pub fn empty<B: KeepBackend + 'static>(backend: Arc<B>, config: CollectionFsConfig) -> Self {
        let fetcher = BlockFetcher::new(backend.clone(), BlockFetcherOptions::default());
        let refresher =
            SignatureRefresher::new(Duration::from_secs(config.guessed_signature_ttl_secs));
        let writers = config.concurrent_writers.max(1);
        CollectionFs {
            core: Arc::new(FsCore {
                tree: RwLock::new(FsTree::new()),
                backend,
                fetcher,
                config,
                refresher,
                refresh_inflight: AtomicBool::new(false),
                write_sem: Arc::new(Semaphore::new(writers)),
                prunes: AtomicU32::new(0),
                prune_notify: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Build the tree from manifest text.
    pub fn with_manifest<B: KeepBackend + 'static>(
        manifest_text: &str,
        backend: Arc<B>,
        config: CollectionFsConfig,
    ) -> KeepResult<Self> {
        let fs = Self::empty(backend, config);
        {
            let mut tree = fs
                .core
                .tree
                .try_write()
                .map_err(|_| KeepError::Internal("new tree is locked".into()))?;
            crate::manifest::parse_manifest(&mut tree, manifest_text)?;
        }
        Ok(fs)
    }

    pub fn config(&self) -> &CollectionFsConfig {
        &self.core.config
    }

    pub(crate) fn max_block(&self) -> u64 {
        self.core.config.max_block_size
    }

    pub fn refresher(&self) -> &SignatureRefresher {
        &self.core.refresher
    }

    pub async fn open(&self, path: &str) -> KeepResult<FileHandle> {
        self.open_with(path, O_RDONLY).await
    }

    pub async fn open_with(&self, path: &str, flags: u32) -> KeepResult<FileHandle> {
        let mode = parse_flags(flags)?;
        let comps = normalize_path(path);
        let mut tree = self.core.tree.write().await;

        let (dir_id, name) = match comps.split_last() {
            None => {
                if mode.writable || mode.trunc || (mode.create && mode.excl) {
                    return Err(KeepError::InvalidArgument("is a directory".into()));
                }
                return Ok(self.handle(tree.root, ".".into(), &mode, true));
            }
            Some((name, parents)) => (tree.resolve(parents)?, name.clone()),
        };

        match tree.dir(dir_id)?.children.get(&name).copied() {
            Some(id) if tree.node(id).is_dir() => {
                if mode.create && mode.excl {
                    return Err(KeepError::Exists);
                }
                if mode.writable || mode.trunc {
                    return Err(KeepError::InvalidArgument("is a directory".into()));
                }
                Ok(self.handle(id, name, &mode, true))
            }
            Some(id) => {
                if mode.create && mode.excl {
                    return Err(KeepError::Exists);
                }
                if mode.trunc {
                    tree.file_mut(id)?.truncate_to(0);
                }
                Ok(self.handle(id, name, &mode, false))
            }
            None => {
                if !mode.create {
                    return Err(KeepError::NotExist);
                }
                let id = tree.alloc(Node::File(FileNode::new()));
                tree.dir_mut(dir_id)?.children.insert(name.clone(), id);
                Ok(self.handle(id, name, &mode, false))
            }
        }
    }

    fn handle(&self, id: NodeId, name: String, mode: &OpenMode, is_dir: bool) -> FileHandle {
        FileHandle {
            fs: self.clone(),
            id,
            name,
            readable: mode.readable,
            writable: mode.writable && !is_dir,
            append: mode.append,
            is_dir,
            pos: Mutex::new(0),
        }
    }

    pub async fn mkdir(&self, path: &str) -> KeepResult<()> {
        let comps = normalize_path(path);
        let (name, parents) = comps.split_last().ok_or(KeepError::Exists)?;
        let mut tree = self.core.tree.write().await;
        let dir_id = tree.resolve(parents)?;
        if tree.dir(dir_id)?.children.contains_key(name) {
            return Err(KeepError::Exists);
        }
        let id = tree.alloc(Node::Dir(DirNode::new()));
        tree.dir_mut(dir_id)?.children.insert(name.clone(), id);
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> KeepResult<()> {
        self.remove_impl(path, false).await
    }

    pub async fn remove_all(&self, path: &str) -> KeepResult<()> {
        match self.remove_impl(path, true).await {
            Err(KeepError::NotExist) => Ok(()),
            other => other,
        }
    }

    async fn remove_impl(&self, path: &str, recursive: bool) -> KeepResult<()> {
        match raw_last_component(path) {
            None => return Err(KeepError::InvalidArgument("cannot remove root".into())),
            Some(".") | Some("..") => {
                return Err(KeepError::InvalidArgument(format!(
                    "cannot remove {:?}",
                    path
                )))
            }
            Some(_) => {}
        }
        let comps = normalize_path(path);
        let (name, parents) = comps
            .split_last()
            .ok_or_else(|| KeepError::InvalidArgument("cannot remove root".into()))?;
        let mut tree = self.core.tree.write().await;
        let dir_id = tree.resolve(parents)?;
        let id = *tree
            .dir(dir_id)?
            .children
            .get(name)
            .ok_or(KeepError::NotExist)?;
        if let Node::Dir(d) = tree.node(id) {
            if !recursive && !d.children.is_empty() {
                return Err(KeepError::DirectoryNotEmpty);
            }
        }
        tree.dir_mut(dir_id)?.children.remove(name);
        tree.remove_subtree(id);
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> KeepResult<()> {
        if matches!(raw_last_component(to), Some(".") | Some("..")) {
            return Err(KeepError::InvalidArgument(format!("bad target {:?}", to)));
        }
        let from_comps = normalize_path(from);
        let to_comps = normalize_path(to);
        if from_comps.is_empty() || to_comps.is_empty() {
            return Err(KeepError::InvalidArgument("cannot rename root".into()));
        }
        if from_comps == to_comps {
            return Ok(());
        }
        if to_comps.starts_with(&from_comps) {
            return Err(KeepError::InvalidArgument(format!(
                "{:?} is inside {:?}",
                to, from
            )));
        }

        let mut tree = self.core.tree.write().await;
        let (from_name, from_parents) = from_comps.split_last().unwrap();
        let (to_name, to_parents) = to_comps.split_last().unwrap();
        let from_dir = tree.resolve(from_parents)?;
        let to_dir = tree.resolve(to_parents)?;
        tree.dir(to_dir)?;
        let src = *tree
            .dir(from_dir)?
            .children
            .get(from_name)
            .ok_or(KeepError::NotExist)?;
        let src_is_dir = tree.node(src).is_dir();

        let replaced = tree.dir(to_dir)?.children.get(to_name).copied();
        if let Some(existing) = replaced {
            match tree.node(existing) {
                Node::File(_) => {
                    if src_is_dir {
                        return Err(KeepError::NotADirectory(format!(
                            "{:?} is not a directory",
                            to
                        )));
                    }
                }
                Node::Dir(d) => {
                    if !src_is_dir {
                        return Err(KeepError::Exists);
                    }
                    if !d.children.is_empty() {
                        return Err(KeepError::DirectoryNotEmpty);
                    }
                }
            }
            tree.dir_mut(to_dir)?.children.remove(to_name);
            tree.remove_subtree(existing);
        }

        tree.dir_mut(from_dir)?.children.remove(from_name);
        tree.dir_mut(to_dir)?.children.insert(to_name.clone(), src);
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> KeepResult<FileInfo> {
        let comps = normalize_path(path);
        let tree = self.core.tree.read().await;
        let id = tree.resolve(&comps)?;
        let name = comps.last().cloned().unwrap_or_else(|| ".".to_string());
        Ok(file_info(&tree, id, name))
    }

    /// Directory listing in name order.
    pub async fn read_dir(&self, path: &str) -> KeepResult<Vec<FileInfo>> {
        let comps = normalize_path(path);
        let tree = self.core.tree.read().await;
        let id = tree.resolve(&comps)?;
        let dir = tree.dir(id)?;
        Ok(dir
            .children
            .iter()
            .map(|(name, &child)| file_info(&tree, child, name.clone()))
            .collect())
    }

    /// Sum of all file sizes.
    pub async fn size(&self) -> u64 {
        self.core.tree.read().await.total_size()
    }

    /// Bytes of buffered write data plus bookkeeping overhead; the
    /// backpressure signal for callers deciding when to flush.
    pub async fn memory_size(&self) -> u64 {
        self.core.tree.read().await.memory_size()
    }

    /// Wait for every in-flight background flush to settle.
    pub async fn wait_prune(&self) {
        loop {
            let notified = self.core.prune_notify.notified();
            if self.core.prunes.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Copy of a subtree. Stored segments are shared by reference; memory
    /// buffers are deep-copied so no buffer ends up owned by two files.
    pub async fn snapshot(&self, path: &str) -> KeepResult<Snapshot> {
        let comps = normalize_path(path);
        let tree = self.core.tree.read().await;
        let id = tree.resolve(&comps)?;
        Ok(Snapshot {
            node: snap_capture(&tree, id),
        })
    }

    /// Graft `snap` over `path`, creating parent directories as needed and
    /// replacing whatever `path` named before.
    pub async fn splice(&self, path: &str, snap: &Snapshot) -> KeepResult<()> {
        let comps = normalize_path(path);
        let mut tree = self.core.tree.write().await;
        match comps.split_last() {
            None => {
                let children = match &snap.node {
                    SnapNode::Dir { children } => children,
                    SnapNode::File { .. } => {
                        return Err(KeepError::InvalidArgument(
                            "cannot splice a file over the root".into(),
                        ))
                    }
                };
                let old: Vec<NodeId> = {
                    let root = tree.dir(tree.root)?;
                    root.children.values().copied().collect()
                };
                for id in old {
                    tree.remove_subtree(id);
                }
                let mut new_children = BTreeMap::new();
                for (name, child) in children {
                    new_children.insert(name.clone(), snap_materialize(&mut tree, child));
                }
                let root = tree.root;
                tree.dir_mut(root)?.children = new_children;
            }
            Some((name, parents)) => {
                let root = tree.root;
                let dir_id = tree.mkdir_p(root, parents)?;
                if let Some(&old) = tree.dir(dir_id)?.children.get(name) {
                    tree.dir_mut(dir_id)?.children.remove(name);
                    tree.remove_subtree(old);
                }
                let id = snap_materialize(&mut tree, &snap.node);
                tree.dir_mut(dir_id)?.children.insert(name.clone(), id);
            }
        }
        Ok(())
    }

    /// Synchronously reissue signatures for every stored locator in one
    /// file. Called when a read finds an expired signature; failure fails
    /// the read.
    pub(crate) async fn refresh_file_signatures(&self, id: NodeId) -> KeepResult<()> {
        let targets = {
            let tree = self.core.tree.read().await;
            let file = tree.file(id)?;
            refresh_targets(file.segments.iter())
        };
        let fresh = self.resolve_refresh_targets(targets).await?;
        let mut tree = self.core.tree.write().await;
        if let Ok(file) = tree.file_mut(id) {
            for seg in &mut file.segments {
                if let Segment::Stored(s) = seg {
                    if let Some(new_loc) = fresh.get(&strip_all_hints(&s.locator)) {
                        s.locator = new_loc.clone();
                    }
                }
            }
        }
        Ok(())
    }

    /// One-shot asynchronous refresh of every stored locator in the
    /// collection. At most one task runs at a time.
    pub(crate) fn spawn_refresh_all(&self) {
        if self.core.refresh_inflight.swap(true, Ordering::SeqCst) {
            return;
        }
        let fs = self.clone();
        tokio::spawn(async move {
            if let Err(err) = fs.refresh_all_signatures().await {
                warn!("async signature refresh failed: {}", err);
            }
            fs.core.refresh_inflight.store(false, Ordering::SeqCst);
        });
    }

    pub(crate) async fn refresh_all_signatures(&self) -> KeepResult<()> {
        let targets = {
            let tree = self.core.tree.read().await;
            let mut segs = Vec::new();
            tree.for_each_stored(|s| segs.push(Segment::Stored(s.clone())));
            refresh_targets(segs.iter())
        };
        let fresh = self.resolve_refresh_targets(targets).await?;
        let mut tree = self.core.tree.write().await;
        tree.for_each_stored_mut(|s| {
            if let Some(new_loc) = fresh.get(&strip_all_hints(&s.locator)) {
                s.locator = new_loc.clone();
            }
        });
        Ok(())
    }

    async fn resolve_refresh_targets(
        &self,
        targets: HashMap<String, String>,
    ) -> KeepResult<HashMap<String, String>> {
        let mut fresh = HashMap::new();
        for (key, input) in targets {
            let new_loc = self
                .core
                .backend
                .local_locator(&input)
                .await
                .map_err(|err| {
                    KeepError::SignatureExpired(format!("refresh of {} failed: {}", input, err))
                })?;
            if let Ok(Some(expiry)) = signature_expiry_time(&new_loc) {
                self.core.refresher.note_refreshed(expiry);
            }
            fresh.insert(key, new_loc);
        }
        Ok(fresh)
    }
}

/// Distinct stored locators of a segment list, keyed by stripped form.
/// Remote locators are forwarded as-is so the resolver can see the `+R`
/// hint; stale local signatures are stripped first.
fn refresh_targets<'a, I: Iterator<Item = &'a Segment>>(segments: I) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for seg in segments {
        if let Segment::Stored(s) = seg {
            if let Ok(loc) = Locator::parse(&s.locator) {
                let input = if loc.is_remote() {
                    s.locator.clone()
                } else {
                    loc.without_signatures().to_string()
                };
                out.entry(loc.stripped()).or_insert(input);
            }
        }
    }
    out
}

fn file_info(tree: &FsTree, id: NodeId, name: String) -> FileInfo {
    match tree.node(id) {
        Node::File(f) => FileInfo {
            name,
            size: f.size,
            is_dir: false,
            mtime: f.mtime,
        },
        Node::Dir(d) => FileInfo {
            name,
            size: d.children.len() as u64,
            is_dir: true,
            mtime: d.mtime,
        },
    }
}

fn raw_last_component(path: &str) -> Option<&str> {
    path.split('/').filter(|c| !c.is_empty()).last()
}

/// An open file (or directory) within a collection filesystem. Cheap to
/// create; holds no OS resources. Each handle has its own position.
pub struct FileHandle {
    fs: CollectionFs,
    pub(crate) id: NodeId,
    name: String,
    readable: bool,
    writable: bool,
    append: bool,
    is_dir: bool,
    pos: Mutex<u64>,
}

enum ReadStep {
    Eof,
    Mem(usize),
    Stored {
        locator: String,
        block_off: u64,
        len: usize,
    },
}

impl FileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub async fn stat(&self) -> KeepResult<FileInfo> {
        let tree = self.fs.core.tree.read().await;
        if tree.get(self.id).is_none() {
            return Err(KeepError::NotExist);
        }
        Ok(file_info(&tree, self.id, self.name.clone()))
    }

    pub async fn size(&self) -> KeepResult<u64> {
        Ok(self.stat().await?.size)
    }

    /// Read from the current position. Returns 0 at end of file.
    pub async fn read(&self, dst: &mut [u8]) -> KeepResult<usize> {
        let pos = *self.pos.lock().unwrap();
        let n = self.read_at(pos, dst).await?;
        *self.pos.lock().unwrap() = pos + n as u64;
        Ok(n)
    }

    pub async fn read_at(&self, mut pos: u64, dst: &mut [u8]) -> KeepResult<usize> {
        if self.is_dir {
            return Err(KeepError::InvalidArgument("is a directory".into()));
        }
        if !self.readable {
            return Err(KeepError::WriteOnlyFile);
        }
        let mut filled = 0usize;
        let mut refreshed = false;
        while filled < dst.len() {
            let step = {
                let tree = self.fs.core.tree.read().await;
                let file = tree.file(self.id)?;
                match file.locate(pos) {
                    None => ReadStep::Eof,
                    Some((idx, off)) => match &file.segments[idx] {
                        Segment::Memory(m) => {
                            let off = off as usize;
                            let n = (dst.len() - filled).min(m.len - off);
                            dst[filled..filled + n]
                                .copy_from_slice(&m.bytes()[off..off + n]);
                            ReadStep::Mem(n)
                        }
                        Segment::Stored(s) => ReadStep::Stored {
                            locator: s.locator.clone(),
                            block_off: s.offset + off,
                            len: (dst.len() - filled).min((s.length - off) as usize),
                        },
                    },
                }
            };
            match step {
                ReadStep::Eof => break,
                ReadStep::Mem(n) => {
                    filled += n;
                    pos += n as u64;
                }
                ReadStep::Stored {
                    locator,
                    block_off,
                    len,
                } => {
                    let expiry = signature_expiry_time(&locator).ok().flatten();
                    match self.fs.core.refresher.action_for(expiry) {
                        RefreshAction::Sync => {
                            if refreshed {
                                return Err(KeepError::SignatureExpired(format!(
                                    "still expired after refresh: {}",
                                    locator
                                )));
                            }
                            self.fs.refresh_file_signatures(self.id).await?;
                            refreshed = true;
                            continue;
                        }
                        RefreshAction::Async => self.fs.spawn_refresh_all(),
                        RefreshAction::None => {}
                    }
                    let n = self
                        .fs
                        .core
                        .fetcher
                        .read_range(
                            &self.fs.core.cancel,
                            &locator,
                            block_off,
                            &mut dst[filled..filled + len],
                        )
                        .await?;
                    if n == 0 {
                        return Err(KeepError::IoError(format!(
                            "short read of {} at {}",
                            locator, block_off
                        )));
                    }
                    refreshed = false;
                    filled += n;
                    pos += n as u64;
                }
            }
        }
        Ok(filled)
    }

    /// Write at the current position (or at end of file with `O_APPEND`).
    /// A position past the end leaves a zero-filled gap.
    pub async fn write(&self, data: &[u8]) -> KeepResult<usize> {
        if self.is_dir {
            return Err(KeepError::InvalidArgument("is a directory".into()));
        }
        if !self.writable {
            return Err(KeepError::ReadOnlyFile);
        }
        let jobs;
        let pos;
        {
            let mut tree = self.fs.core.tree.write().await;
            let max_block = self.fs.max_block();
            let file = tree.file_mut(self.id)?;
            pos = if self.append {
                file.size
            } else {
                *self.pos.lock().unwrap()
            };
            file.write_at(pos, data);
            jobs = crate::flush::carve_full_jobs(self.id, file, max_block);
            if !jobs.is_empty() {
                file.pruning += jobs.len() as u32;
                self.fs
                    .core
                    .prunes
                    .fetch_add(jobs.len() as u32, Ordering::SeqCst);
            }
        }
        *self.pos.lock().unwrap() = pos + data.len() as u64;
        for job in jobs {
            self.fs.spawn_prune(job);
        }
        Ok(data.len())
    }

    pub async fn truncate(&self, n: u64) -> KeepResult<()> {
        if self.is_dir {
            return Err(KeepError::InvalidArgument("is a directory".into()));
        }
        if !self.writable {
            return Err(KeepError::ReadOnlyFile);
        }
        let mut tree = self.fs.core.tree.write().await;
        tree.file_mut(self.id)?.truncate_to(n);
        Ok(())
    }

    pub async fn seek(&self, from: SeekFrom) -> KeepResult<u64> {
        let target = match from {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => *self.pos.lock().unwrap() as i128 + d as i128,
            SeekFrom::End(d) => {
                let size = {
                    let tree = self.fs.core.tree.read().await;
                    tree.file(self.id).map(|f| f.size).unwrap_or(0)
                };
                size as i128 + d as i128
            }
        };
        if target < 0 {
            return Err(KeepError::InvalidArgument("negative seek position".into()));
        }
        let target = target as u64;
        *self.pos.lock().unwrap() = target;
        Ok(target)
    }

    /// Block until no background flush is in flight for this file.
    pub async fn wait_prune(&self) {
        loop {
            let notified = self.fs.core.prune_notify.notified();
            {
                let tree = self.fs.core.tree.read().await;
                match tree.file(self.id) {
                    Ok(f) if f.pruning > 0 => {}
                    _ => return,
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
impl CollectionFs {
    /// (count, bytes) of memory segments in the file at `path`.
    pub(crate) async fn mem_extents(&self, path: &str) -> KeepResult<(usize, u64)> {
        let tree = self.core.tree.read().await;
        let id = tree.resolve(&normalize_path(path))?;
        let file = tree.file(id)?;
        let mut count = 0;
        let mut bytes = 0;
        for seg in &file.segments {
            if seg.is_memory() {
                count += 1;
                bytes += seg.len();
            }
        }
        Ok((count, bytes))
    }
}

pub struct Snapshot {
    node: SnapNode,
}

enum SnapNode {
    File { size: u64, segments: Vec<Segment> },
    Dir { children: BTreeMap<String, SnapNode> },
}

fn snap_capture(tree: &FsTree, id: NodeId) -> SnapNode {
    match tree.node(id) {
        Node::File(f) => SnapNode::File {
            size: f.size,
            segments: f.segments.iter().map(deep_copy_segment).collect(),
        },
        Node::Dir(d) => SnapNode::Dir {
            children: d
                .children
                .iter()
                .map(|(name, &child)| (name.clone(), snap_capture(tree, child)))
                .collect(),
        },
    }
}

fn snap_materialize(tree: &mut FsTree, node: &SnapNode) -> NodeId {
    match node {
        SnapNode::File { size, segments } => {
            let mut file = FileNode::new();
            file.segments = segments.iter().map(deep_copy_segment).collect();
            file.size = *size;
            file.recount_memsize();
            tree.alloc(Node::File(file))
        }
        SnapNode::Dir { children } => {
            let mut dir = DirNode::new();
            let ids: Vec<(String, NodeId)> = children
                .iter()
                .map(|(name, child)| (name.clone(), snap_materialize(tree, child)))
                .collect();
            dir.children.extend(ids);
            tree.alloc(Node::Dir(dir))
        }
    }
}

fn deep_copy_segment(seg: &Segment) -> Segment {
    match seg {
        Segment::Memory(m) => Segment::Memory(MemSegment::from_slice(m.bytes())),
        Segment::Stored(s) => Segment::Stored(s.clone()),
    }
}
