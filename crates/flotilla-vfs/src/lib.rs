//! A POSIX-like virtual filesystem over any flotilla backend.
//!
//! The VFS presents an in-memory tree of directory and file nodes rooted at
//! an `Fs` root, with `open`/`read`/`write`/`seek` handles carrying fixed
//! POSIX-style modes. File data is staged according to the cache mode:
//!
//! - [`CacheMode::Off`] / [`CacheMode::Minimal`]: written files are buffered
//!   in memory and uploaded when the last handle closes; reads stream.
//! - [`CacheMode::Writes`]: written files land in the on-disk page cache
//!   and upload on close; plain reads still stream.
//! - [`CacheMode::Full`]: the page cache backs reads and writes; pages are
//!   fetched on demand and evicted by LRU within a size budget.
//!
//! One deliberate deviation from Linux: `O_TRUNC` combined with `O_RDONLY`
//! fails with `EINVAL` instead of truncating, for existing and non-existent
//! files alike.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

pub mod cache;
pub mod chunked_reader;
pub mod error;
pub mod node;
pub mod ranges;

pub use cache::{CacheItem, CacheManager, CacheOpts};
pub use chunked_reader::ChunkedReader;
pub use error::{VfsError, VfsResult};
pub use node::{NodeId, NodeInfo};
pub use ranges::{Range, Ranges};

use flotilla_core::error::FsError;
use flotilla_core::fal::{ByteReader, Fs, ObjectMeta, OpenOption};
use flotilla_core::path::split;
use flotilla_core::Ctx;

use node::{DirNode, FileContent, FileNode, Node, NodeKind, NodeTable, ROOT};

/// Open-flag bits, Linux-shaped.
pub mod flags {
    pub const O_RDONLY: u32 = 0o0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_CREATE: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_SYNC: u32 = 0o10000;
}

use flags::*;

/// How file data is staged between handles and the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Off,
    Minimal,
    Writes,
    Full,
}

/// VFS construction options.
#[derive(Debug, Clone)]
pub struct VfsOpts {
    pub cache_mode: CacheMode,
    /// Page cache settings; required for `Writes` and `Full`.
    pub cache: Option<CacheOpts>,
    /// Initial window of the streaming read path.
    pub read_window_initial: u64,
    /// Window cap of the streaming read path.
    pub read_window_max: u64,
}

impl Default for VfsOpts {
    fn default() -> Self {
        VfsOpts {
            cache_mode: CacheMode::Off,
            cache: None,
            read_window_initial: chunked_reader::DEFAULT_INITIAL_WINDOW,
            read_window_max: chunked_reader::DEFAULT_MAX_WINDOW,
        }
    }
}

/// The virtual filesystem.
pub struct Vfs {
    fs: Arc<dyn Fs>,
    opts: VfsOpts,
    table: NodeTable,
    cache: Option<Arc<CacheManager>>,
    ctx: Ctx,
}

impl Vfs {
    pub async fn new(fs: Arc<dyn Fs>, opts: VfsOpts) -> VfsResult<Arc<Vfs>> {
        let cache = match opts.cache_mode {
            CacheMode::Writes | CacheMode::Full => {
                let copts = opts
                    .cache
                    .clone()
                    .ok_or(VfsError::Enosys)?;
                Some(CacheManager::new(copts, &fs.string()).await?)
            }
            _ => None,
        };
        Ok(Arc::new(Vfs {
            fs,
            opts,
            table: NodeTable::new(),
            cache,
            ctx: Ctx::new(),
        }))
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    pub fn cache_manager(&self) -> Option<&Arc<CacheManager>> {
        self.cache.as_ref()
    }

    /// Spawn the background maintenance task: uploads idle dirty files and
    /// evicts the cache on an interval. Stops when the VFS context is
    /// cancelled.
    pub fn start_background(self: &Arc<Self>, interval: Duration) {
        let vfs = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = vfs.ctx.cancel_token().cancelled() => break,
                    _ = timer.tick() => {
                        if let Err(err) = vfs.flush_idle().await {
                            warn!(error = %err, "background flush failed");
                        }
                        if let Some(cache) = &vfs.cache {
                            cache.evict().await;
                        }
                    }
                }
            }
        });
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        self.ctx.cancel();
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Populate a directory's children from the remote, once.
    async fn ensure_listed(&self, dir_id: NodeId) -> VfsResult<()> {
        let path = self.table.path_of(dir_id);
        let already = self
            .table
            .with(dir_id, |n| match &n.kind {
                NodeKind::Dir(d) => d.listed,
                NodeKind::File(_) => true,
            })
            .ok_or(VfsError::Enoent)?;
        if already {
            return Ok(());
        }

        match self.fs.list(&path).await {
            Ok(entries) => {
                for entry in entries {
                    let remote = entry.remote();
                    let (_, leaf) = split(&remote);
                    if self.table.child(dir_id, leaf).is_some() {
                        // A locally created (possibly dirty) node wins.
                        continue;
                    }
                    let kind = match &entry {
                        flotilla_core::fal::DirEntry::Dir(d) => NodeKind::Dir(DirNode {
                            children: Default::default(),
                            listed: false,
                            mod_time: d.mod_time,
                            dirty: false,
                        }),
                        flotilla_core::fal::DirEntry::Object(o) => NodeKind::File(FileNode {
                            size: o.size(),
                            mod_time: o.mod_time(),
                            dirty: false,
                            exists_remote: true,
                            open_handles: 0,
                            content: Arc::new(tokio::sync::Mutex::new(FileContent::Remote)),
                        }),
                    };
                    self.table.insert(dir_id, leaf, kind);
                }
            }
            // A directory that only exists locally lists as empty.
            Err(FsError::DirNotFound(_)) => {}
            Err(err) => return Err(VfsError::from_backend(err)),
        }
        self.table.with_mut(dir_id, |n| {
            if let NodeKind::Dir(d) = &mut n.kind {
                d.listed = true;
            }
        });
        Ok(())
    }

    /// Resolve a path to a node id.
    async fn lookup(&self, path: &str) -> VfsResult<NodeId> {
        let mut cursor = ROOT;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let is_dir = self
                .table
                .with(cursor, Node::is_dir)
                .ok_or(VfsError::Enoent)?;
            if !is_dir {
                return Err(VfsError::Enotdir);
            }
            self.ensure_listed(cursor).await?;
            cursor = self.table.child(cursor, part).ok_or(VfsError::Enoent)?;
        }
        Ok(cursor)
    }

    /// Resolve the parent directory of `path`, returning `(dir_id, leaf)`.
    async fn lookup_parent<'p>(&self, path: &'p str) -> VfsResult<(NodeId, &'p str)> {
        let (dir, leaf) = split(path);
        if leaf.is_empty() {
            return Err(VfsError::Einval);
        }
        let dir_id = self.lookup(dir).await?;
        if !self.table.with(dir_id, Node::is_dir).unwrap_or(false) {
            return Err(VfsError::Enotdir);
        }
        self.ensure_listed(dir_id).await?;
        Ok((dir_id, leaf))
    }

    fn info(&self, id: NodeId) -> Option<NodeInfo> {
        let path = self.table.path_of(id);
        self.table.with(id, |n| match &n.kind {
            NodeKind::Dir(d) => NodeInfo {
                path: path.clone(),
                is_dir: true,
                size: 0,
                mod_time: d.mod_time,
                dirty: d.dirty,
            },
            NodeKind::File(f) => NodeInfo {
                path: path.clone(),
                is_dir: false,
                size: f.size,
                mod_time: f.mod_time,
                dirty: f.dirty,
            },
        })
    }

    // ------------------------------------------------------------------
    // Directory surface
    // ------------------------------------------------------------------

    pub async fn stat(&self, path: &str) -> VfsResult<NodeInfo> {
        let id = self.lookup(path).await?;
        self.info(id).ok_or(VfsError::Enoent)
    }

    pub async fn readdir(&self, path: &str) -> VfsResult<Vec<NodeInfo>> {
        let id = self.lookup(path).await?;
        if !self.table.with(id, Node::is_dir).unwrap_or(false) {
            return Err(VfsError::Enotdir);
        }
        self.ensure_listed(id).await?;
        let children: Vec<NodeId> = self
            .table
            .with(id, |n| match &n.kind {
                NodeKind::Dir(d) => d.children.values().copied().collect(),
                NodeKind::File(_) => Vec::new(),
            })
            .unwrap_or_default();
        Ok(children.into_iter().filter_map(|c| self.info(c)).collect())
    }

    pub async fn mkdir(&self, path: &str) -> VfsResult<()> {
        let (parent, leaf) = self.lookup_parent(path).await?;
        if self.table.child(parent, leaf).is_some() {
            return Err(VfsError::Eexist);
        }
        self.fs
            .mkdir(path)
            .await
            .map_err(VfsError::from_backend)?;
        self.table.insert(
            parent,
            leaf,
            NodeKind::Dir(DirNode {
                children: Default::default(),
                listed: true,
                mod_time: Utc::now(),
                dirty: false,
            }),
        );
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> VfsResult<()> {
        let id = self.lookup(path).await?;
        if !self.table.with(id, Node::is_dir).unwrap_or(false) {
            return Err(VfsError::Enotdir);
        }
        self.ensure_listed(id).await?;
        let empty = self
            .table
            .with(id, |n| match &n.kind {
                NodeKind::Dir(d) => d.children.is_empty(),
                NodeKind::File(_) => false,
            })
            .unwrap_or(false);
        if !empty {
            return Err(VfsError::Enotempty);
        }
        match self.fs.rmdir(path).await {
            Ok(()) | Err(FsError::DirNotFound(_)) => {}
            Err(err) => return Err(VfsError::from_backend(err)),
        }
        self.table.remove(id);
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> VfsResult<()> {
        let id = self.lookup(path).await?;
        let exists_remote = self
            .table
            .with(id, |n| match &n.kind {
                NodeKind::Dir(_) => None,
                NodeKind::File(f) => Some(f.exists_remote),
            })
            .ok_or(VfsError::Enoent)?
            .ok_or(VfsError::Eisdir)?;

        if exists_remote {
            match self.fs.new_object(path).await {
                Ok(obj) => obj.remove().await.map_err(VfsError::from_backend)?,
                Err(FsError::ObjectNotFound(_)) => {}
                Err(err) => return Err(VfsError::from_backend(err)),
            }
        }
        if let Some(cache) = &self.cache {
            cache.discard(path).await;
        }
        self.table.remove(id);
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let id = self.lookup(from).await?;
        if self.table.with(id, Node::is_dir).unwrap_or(false) {
            return Err(VfsError::Eisdir);
        }
        // Unflushed data must reach the remote under the old name first so
        // the move sees a complete object.
        self.flush_path(from).await?;

        let obj = self
            .fs
            .new_object(from)
            .await
            .map_err(VfsError::from_backend)?;
        if self.fs.features().move_obj {
            self.fs
                .move_obj(obj, to)
                .await
                .map_err(VfsError::from_backend)?;
        } else {
            let reader = obj.open(&[]).await.map_err(VfsError::from_backend)?;
            let meta = ObjectMeta::new(to, Some(obj.size()), obj.mod_time());
            self.fs
                .put(reader, &meta)
                .await
                .map_err(VfsError::from_backend)?;
            obj.remove().await.map_err(VfsError::from_backend)?;
        }
        if let Some(cache) = &self.cache {
            cache.discard(from).await;
        }

        let (size, mod_time) = self
            .table
            .with(id, |n| match &n.kind {
                NodeKind::File(f) => (f.size, f.mod_time),
                NodeKind::Dir(_) => (0, Utc::now()),
            })
            .ok_or(VfsError::Enoent)?;
        self.table.remove(id);
        let (parent, leaf) = self.lookup_parent(to).await?;
        self.table.insert(
            parent,
            leaf,
            NodeKind::File(FileNode {
                size,
                mod_time,
                dirty: false,
                exists_remote: true,
                open_handles: 0,
                content: Arc::new(tokio::sync::Mutex::new(FileContent::Remote)),
            }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    /// Open `path` with POSIX-style `flags`; the returned handle's mode is
    /// fixed for its lifetime.
    pub async fn open(self: &Arc<Self>, path: &str, fl: u32) -> VfsResult<Handle> {
        let acc = fl & O_ACCMODE;
        if acc == O_ACCMODE {
            return Err(VfsError::Einval);
        }
        // Deliberate deviation from Linux: never truncate through a
        // read-only descriptor, whether or not the file exists.
        if fl & O_TRUNC != 0 && acc == O_RDONLY {
            return Err(VfsError::Einval);
        }
        let writable = acc != O_RDONLY;

        let (parent, leaf) = self.lookup_parent(path).await?;
        let existing = self.table.child(parent, leaf);

        let node_id = match existing {
            Some(id) => {
                if self.table.with(id, Node::is_dir).unwrap_or(false) {
                    return Err(VfsError::Eisdir);
                }
                if fl & O_CREATE != 0 && fl & O_EXCL != 0 {
                    return Err(VfsError::Eexist);
                }
                id
            }
            None => {
                if fl & O_CREATE == 0 {
                    return Err(VfsError::Enoent);
                }
                trace!(path, "creating file node");
                self.table.insert(
                    parent,
                    leaf,
                    NodeKind::File(FileNode {
                        size: 0,
                        mod_time: Utc::now(),
                        dirty: true,
                        exists_remote: false,
                        open_handles: 0,
                        content: Arc::new(tokio::sync::Mutex::new(FileContent::Memory(
                            Vec::new(),
                        ))),
                    }),
                )
            }
        };

        // Stage content according to the cache mode before the first I/O.
        let content = self
            .table
            .with(node_id, |n| match &n.kind {
                NodeKind::File(f) => Arc::clone(&f.content),
                NodeKind::Dir(_) => unreachable!("directories rejected above"),
            })
            .ok_or(VfsError::Enoent)?;

        let created = existing.is_none();
        if fl & O_TRUNC != 0 || created {
            // A fresh node starts from zero bytes in the mode's native
            // staging (memory buffer or cache item).
            self.truncate_node(node_id, &content).await?;
        } else if writable {
            self.stage_for_write(node_id, path, &content).await?;
        } else if matches!(self.opts.cache_mode, CacheMode::Full) {
            self.stage_cached(node_id, path, &content).await?;
        }

        // One cache reference per handle whose content is cache-backed at
        // open time keeps the item pinned while in use.
        let retained_cache = {
            let guard = content.lock().await;
            match &*guard {
                FileContent::Cached(item) => {
                    item.retain();
                    true
                }
                _ => false,
            }
        };

        let is_dirty = self
            .table
            .with_mut(node_id, |n| match &mut n.kind {
                NodeKind::File(f) => {
                    f.open_handles += 1;
                    f.dirty
                }
                NodeKind::Dir(_) => false,
            })
            .unwrap_or(false);
        if is_dirty {
            self.table.propagate_dirty(node_id);
        }

        debug!(path, flags = format!("{fl:o}"), "handle opened");
        Ok(Handle {
            vfs: Arc::clone(self),
            node: node_id,
            path: path.to_string(),
            flags: fl,
            pos: 0,
            reader: None,
            retained_cache,
            closed: false,
        })
    }

    /// Truncate a node to zero bytes, staging writable content.
    async fn truncate_node(
        &self,
        node_id: NodeId,
        content: &Arc<tokio::sync::Mutex<FileContent>>,
    ) -> VfsResult<()> {
        let mut guard = content.lock().await;
        match self.opts.cache_mode {
            CacheMode::Off | CacheMode::Minimal => {
                *guard = FileContent::Memory(Vec::new());
            }
            CacheMode::Writes | CacheMode::Full => {
                let cache = self.cache.as_ref().ok_or(VfsError::Enosys)?;
                let path = self.table.path_of(node_id);
                let item = match &*guard {
                    FileContent::Cached(item) => Arc::clone(item),
                    _ => cache.open(&path),
                };
                item.truncate(0).await?;
                *guard = FileContent::Cached(item);
            }
        }
        drop(guard);
        self.table.with_mut(node_id, |n| {
            if let NodeKind::File(f) = &mut n.kind {
                f.size = 0;
                f.dirty = true;
                f.mod_time = Utc::now();
            }
        });
        self.table.propagate_dirty(node_id);
        Ok(())
    }

    /// Make a node's content writable for the current cache mode.
    async fn stage_for_write(
        &self,
        _node_id: NodeId,
        path: &str,
        content: &Arc<tokio::sync::Mutex<FileContent>>,
    ) -> VfsResult<()> {
        let mut guard = content.lock().await;
        match self.opts.cache_mode {
            CacheMode::Off | CacheMode::Minimal => {
                if matches!(&*guard, FileContent::Remote) {
                    // Modifying an existing object without a disk cache
                    // means buffering it whole.
                    let data = self.download_all(path).await?;
                    *guard = FileContent::Memory(data);
                }
            }
            CacheMode::Writes | CacheMode::Full => {
                if matches!(&*guard, FileContent::Remote) {
                    let cache = self.cache.as_ref().ok_or(VfsError::Enosys)?;
                    // Existing remote pages are pulled on demand later.
                    *guard = FileContent::Cached(cache.open(path));
                }
            }
        }
        Ok(())
    }

    /// Back a read-only handle with the page cache (Full mode).
    async fn stage_cached(
        &self,
        _node_id: NodeId,
        path: &str,
        content: &Arc<tokio::sync::Mutex<FileContent>>,
    ) -> VfsResult<()> {
        let mut guard = content.lock().await;
        if matches!(&*guard, FileContent::Remote) {
            let cache = self.cache.as_ref().ok_or(VfsError::Enosys)?;
            *guard = FileContent::Cached(cache.open(path));
        }
        Ok(())
    }

    async fn download_all(&self, path: &str) -> VfsResult<Vec<u8>> {
        match self.fs.new_object(path).await {
            Ok(obj) => {
                let mut reader = obj.open(&[]).await.map_err(VfsError::from_backend)?;
                let mut buf = Vec::with_capacity(obj.size() as usize);
                reader.read_to_end(&mut buf).await?;
                Ok(buf)
            }
            Err(FsError::ObjectNotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(VfsError::from_backend(err)),
        }
    }

    /// Fetch `[start, end)` of a cached item from the remote, page-aligned.
    async fn fetch_into_cache(
        &self,
        path: &str,
        item: &Arc<CacheItem>,
        start: u64,
        end: u64,
    ) -> VfsResult<()> {
        let page = self
            .cache
            .as_ref()
            .map(|c| c.chunk_size())
            .unwrap_or(64 * 1024)
            .max(1);
        let aligned_start = (start / page) * page;
        let aligned_end = end.div_ceil(page) * page;

        for missing in item.missing(aligned_start, aligned_end) {
            let obj = match self.fs.new_object(path).await {
                Ok(obj) => obj,
                // Nothing remote yet: the hole reads as zeroes.
                Err(FsError::ObjectNotFound(_)) => return Ok(()),
                Err(err) => return Err(VfsError::from_backend(err)),
            };
            let remote_size = obj.size();
            if missing.start >= remote_size {
                continue;
            }
            let len = missing.len().min(remote_size - missing.start);
            let mut reader = obj
                .open(&[OpenOption::Range {
                    offset: missing.start,
                    count: Some(len),
                }])
                .await
                .map_err(VfsError::from_backend)?;
            let mut buf = Vec::with_capacity(len as usize);
            reader.read_to_end(&mut buf).await?;
            trace!(path, offset = missing.start, len = buf.len(), "page fetched");
            item.store_fetched(missing.start, &buf).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writeback
    // ------------------------------------------------------------------

    /// Upload one path's dirty content, if any.
    pub async fn flush_path(&self, path: &str) -> VfsResult<()> {
        let id = self.lookup(path).await?;
        self.flush_node(id).await
    }

    async fn flush_node(&self, node_id: NodeId) -> VfsResult<()> {
        let path = self.table.path_of(node_id);
        let (dirty, size, mod_time, content) = match self
            .table
            .with(node_id, |n| match &n.kind {
                NodeKind::File(f) => Some((f.dirty, f.size, f.mod_time, Arc::clone(&f.content))),
                NodeKind::Dir(_) => None,
            })
            .ok_or(VfsError::Enoent)?
        {
            Some(t) => t,
            None => return Ok(()),
        };
        if !dirty {
            return Ok(());
        }

        enum Staged {
            Memory(Vec<u8>),
            Cached(Arc<CacheItem>),
            Nothing,
        }
        let staged = {
            let guard = content.lock().await;
            match &*guard {
                FileContent::Memory(buf) => Staged::Memory(buf.clone()),
                FileContent::Cached(item) => Staged::Cached(Arc::clone(item)),
                FileContent::Remote => Staged::Nothing,
            }
        };

        let data = match staged {
            Staged::Nothing => return Ok(()),
            Staged::Memory(buf) => buf,
            Staged::Cached(item) => {
                // Every page must be local before the object can be
                // reassembled for upload.
                if !item.missing(0, size).is_empty() {
                    self.fetch_into_cache(&path, &item, 0, size).await?;
                }
                let mut buf = item.read_all().await?;
                buf.resize(size as usize, 0);
                let meta = ObjectMeta::new(path.clone(), Some(size), mod_time);
                self.upload(&meta, buf).await?;
                item.set_clean();
                self.mark_clean(node_id);
                return Ok(());
            }
        };

        let meta = ObjectMeta::new(path.clone(), Some(size), mod_time);
        self.upload(&meta, data).await?;
        self.mark_clean(node_id);
        Ok(())
    }

    async fn upload(&self, meta: &ObjectMeta, data: Vec<u8>) -> VfsResult<()> {
        debug!(remote = %meta.remote, size = data.len(), "uploading dirty file");
        let reader: ByteReader = Box::new(std::io::Cursor::new(data));
        self.fs
            .put(reader, meta)
            .await
            .map_err(VfsError::from_backend)?;
        Ok(())
    }

    fn mark_clean(&self, node_id: NodeId) {
        self.table.with_mut(node_id, |n| {
            if let NodeKind::File(f) = &mut n.kind {
                f.dirty = false;
                f.exists_remote = true;
            }
        });
    }

    /// Upload every dirty file that has no open handles.
    pub async fn flush_idle(&self) -> VfsResult<()> {
        let dirty = self.collect_dirty(ROOT);
        for id in dirty {
            let idle = self
                .table
                .with(id, |n| match &n.kind {
                    NodeKind::File(f) => f.open_handles == 0,
                    NodeKind::Dir(_) => false,
                })
                .unwrap_or(false);
            if idle {
                if let Err(err) = self.flush_node(id).await {
                    warn!(error = %err, "idle flush failed");
                }
            }
        }
        self.table.clear_dir_dirty();
        Ok(())
    }

    fn collect_dirty(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            self.table.with(id, |n| match &n.kind {
                NodeKind::Dir(d) => stack.extend(d.children.values().copied()),
                NodeKind::File(f) => {
                    if f.dirty {
                        out.push(id);
                    }
                }
            });
        }
        out
    }
}

/// An open file handle with a fixed mode.
pub struct Handle {
    vfs: Arc<Vfs>,
    node: NodeId,
    path: String,
    flags: u32,
    pos: u64,
    /// Streaming reader for handles serving reads straight off the remote.
    reader: Option<ChunkedReader>,
    /// Whether this handle holds a cache item reference.
    retained_cache: bool,
    closed: bool,
}

impl Handle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn readable(&self) -> bool {
        self.flags & O_ACCMODE != O_WRONLY
    }

    fn writable(&self) -> bool {
        self.flags & O_ACCMODE != O_RDONLY
    }

    fn node_size(&self) -> u64 {
        self.vfs
            .table
            .with(self.node, |n| match &n.kind {
                NodeKind::File(f) => f.size,
                NodeKind::Dir(_) => 0,
            })
            .unwrap_or(0)
    }

    fn content(&self) -> VfsResult<Arc<tokio::sync::Mutex<FileContent>>> {
        self.vfs
            .table
            .with(self.node, |n| match &n.kind {
                NodeKind::File(f) => Some(Arc::clone(&f.content)),
                NodeKind::Dir(_) => None,
            })
            .flatten()
            .ok_or(VfsError::Enoent)
    }

    /// Read at the current position, advancing it.
    pub async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        if !self.readable() {
            return Err(VfsError::Ebadf);
        }
        let n = self.read_at_inner(self.pos, buf).await?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Positional read; does not move the cursor.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        if !self.readable() {
            return Err(VfsError::Ebadf);
        }
        self.read_at_inner(offset, buf).await
    }

    async fn read_at_inner(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let size = self.node_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);

        let content = self.content()?;
        let cached = {
            let guard = content.lock().await;
            match &*guard {
                FileContent::Memory(data) => {
                    let end = (offset as usize + want).min(data.len());
                    let n = end.saturating_sub(offset as usize);
                    buf[..n].copy_from_slice(&data[offset as usize..end]);
                    return Ok(n);
                }
                FileContent::Cached(item) => Some(Arc::clone(item)),
                FileContent::Remote => None,
            }
        };

        match cached {
            Some(item) => {
                let end = offset + want as u64;
                if !item.has_range(offset, end) {
                    self.vfs
                        .fetch_into_cache(&self.path, &item, offset, end)
                        .await?;
                }
                let n = item.read_at(offset, &mut buf[..want]).await?;
                Ok(n)
            }
            None => {
                // Stream through the chunked reader, seeking as needed.
                if self.reader.is_none() {
                    let obj = self
                        .vfs
                        .fs
                        .new_object(&self.path)
                        .await
                        .map_err(VfsError::from_backend)?;
                    self.reader = Some(ChunkedReader::with_windows(
                        obj,
                        self.vfs.opts.read_window_initial,
                        self.vfs.opts.read_window_max,
                    ));
                }
                let reader = self.reader.as_mut().expect("reader just created");
                if reader.position() != offset {
                    reader.seek(SeekFrom::Start(offset))?;
                }
                Ok(reader.read(&mut buf[..want]).await?)
            }
        }
    }

    /// Write at the current position (or the end under `O_APPEND`),
    /// advancing the cursor.
    pub async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        if !self.writable() {
            return Err(VfsError::Ebadf);
        }
        if self.flags & O_APPEND != 0 {
            self.pos = self.node_size();
        }
        let offset = self.pos;
        let n = self.write_at_inner(offset, data).await?;
        self.pos = offset + n as u64;
        Ok(n)
    }

    /// Positional write; does not move the cursor.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        if !self.writable() {
            return Err(VfsError::Ebadf);
        }
        self.write_at_inner(offset, data).await
    }

    async fn write_at_inner(&mut self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        let content = self.content()?;
        let cached = {
            let mut guard = content.lock().await;
            match &mut *guard {
                FileContent::Memory(buf) => {
                    let end = offset as usize + data.len();
                    if buf.len() < end {
                        buf.resize(end, 0);
                    }
                    buf[offset as usize..end].copy_from_slice(data);
                    None
                }
                FileContent::Cached(item) => Some(Arc::clone(item)),
                FileContent::Remote => {
                    // Staging happens at open; reaching here means the
                    // handle was opened read-only and re-used for writes.
                    return Err(VfsError::Ebadf);
                }
            }
        };
        if let Some(item) = cached {
            item.write_at(offset, data).await?;
        }

        let end = offset + data.len() as u64;
        self.vfs.table.with_mut(self.node, |n| {
            if let NodeKind::File(f) = &mut n.kind {
                f.size = f.size.max(end);
                f.dirty = true;
                f.mod_time = Utc::now();
            }
        });
        self.vfs.table.propagate_dirty(self.node);

        if self.flags & O_SYNC != 0 {
            self.vfs.flush_node(self.node).await?;
        }
        Ok(data.len())
    }

    /// Reposition the cursor.
    pub fn seek(&mut self, from: SeekFrom) -> VfsResult<u64> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        let size = self.node_size();
        let next = match from {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::End(delta) => size as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if next < 0 {
            return Err(VfsError::Einval);
        }
        self.pos = next as u64;
        Ok(self.pos)
    }

    /// Push dirty data to the remote without closing.
    pub async fn flush(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        if self.writable() {
            self.vfs.flush_node(self.node).await?;
        }
        Ok(())
    }

    /// Close the handle. When the last handle on a dirty file closes, its
    /// content is uploaded.
    pub async fn close(&mut self) -> VfsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(reader) = &mut self.reader {
            reader.close();
        }

        let remaining = self
            .vfs
            .table
            .with_mut(self.node, |n| match &mut n.kind {
                NodeKind::File(f) => {
                    f.open_handles = f.open_handles.saturating_sub(1);
                    f.open_handles
                }
                NodeKind::Dir(_) => 0,
            })
            .unwrap_or(0);

        // This handle's cache reference goes regardless of other handles.
        if self.retained_cache {
            if let Ok(content) = self.content() {
                let guard = content.lock().await;
                if let FileContent::Cached(item) = &*guard {
                    item.release();
                }
            }
        }

        if remaining == 0 {
            self.vfs.flush_node(self.node).await?;
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.closed {
            // Dropping without close leaks the flush; the background task
            // picks the file up, but surface it loudly in debug builds.
            debug!(path = %self.path, "handle dropped without close");
        }
    }
}
