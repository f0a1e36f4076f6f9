//! The on-disk page cache.
//!
//! Each remote gets a directory under the cache root; each object occupies
//! one sparse file addressed in fixed-size pages. A [`CacheItem`] tracks
//! which byte ranges are present and which are dirty; the index applies an
//! LRU policy with a total-size ceiling and a maximum age. Dirty items are
//! never evicted - they block until the writeback uploads them - and items
//! with open handles are pinned by refcount.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::VfsResult;
use crate::ranges::{Range, Ranges};

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheOpts {
    /// Cache root; a per-remote directory is created beneath it.
    pub dir: PathBuf,
    /// Total on-disk ceiling; `None` is unbounded.
    pub max_size: Option<u64>,
    /// Clean items older than this are evicted regardless of budget.
    pub max_age: Duration,
    /// Page granularity for range fetches.
    pub chunk_size: u64,
}

impl CacheOpts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CacheOpts {
            dir: dir.into(),
            max_size: None,
            max_age: Duration::from_secs(3600),
            chunk_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct ItemState {
    size: u64,
    present: Ranges,
    dirty: Ranges,
    last_access: Instant,
}

/// One cached object's on-disk pages plus bookkeeping.
#[derive(Debug)]
pub struct CacheItem {
    remote: String,
    path: PathBuf,
    refs: AtomicU32,
    state: Mutex<ItemState>,
}

impl CacheItem {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Open handles referencing this item.
    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Take a reference; the item is pinned against eviction while held.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference.
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "cache item released more times than retained");
    }

    /// Logical size of the cached object.
    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.lock().unwrap().dirty.is_empty()
    }

    /// Whether `[start, end)` can be served from disk.
    pub fn has_range(&self, start: u64, end: u64) -> bool {
        self.state.lock().unwrap().present.contains(start, end)
    }

    /// What must be fetched before `[start, end)` can be served.
    pub fn missing(&self, start: u64, end: u64) -> Vec<Range> {
        self.state.lock().unwrap().present.find_missing(start, end)
    }

    fn touch(&self) {
        self.state.lock().unwrap().last_access = Instant::now();
    }

    /// Write fetched (clean) remote data into the page file.
    pub async fn store_fetched(&self, offset: u64, data: &[u8]) -> VfsResult<()> {
        self.write_file(offset, data).await?;
        let mut st = self.state.lock().unwrap();
        st.present.insert(offset, offset + data.len() as u64);
        st.size = st.size.max(offset + data.len() as u64);
        st.last_access = Instant::now();
        Ok(())
    }

    /// Apply a local write: data lands on disk, the range becomes present
    /// and dirty, and the size grows to cover it.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> VfsResult<()> {
        self.write_file(offset, data).await?;
        let mut st = self.state.lock().unwrap();
        let end = offset + data.len() as u64;
        st.present.insert(offset, end);
        st.dirty.insert(offset, end);
        st.size = st.size.max(end);
        st.last_access = Instant::now();
        trace!(remote = %self.remote, offset, len = data.len(), "dirty write");
        Ok(())
    }

    /// Read `[offset, offset+buf.len())` from the page file. The caller is
    /// responsible for having fetched the range first.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        self.touch();
        if buf.is_empty() {
            return Ok(0);
        }
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read the whole cached content (for writeback).
    pub async fn read_all(&self) -> VfsResult<Vec<u8>> {
        let size = self.size() as usize;
        let mut buf = vec![0u8; size];
        let n = self.read_at(0, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Shrink or grow the logical size; coverage past the new end is
    /// dropped and a grow leaves a hole of zeroes, which sparse files give
    /// us for free.
    pub async fn truncate(&self, size: u64) -> VfsResult<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        file.set_len(size).await?;
        let mut st = self.state.lock().unwrap();
        st.present.truncate(size);
        st.dirty.truncate(size);
        if size > 0 {
            // Everything below the new end is defined (zeroes count).
            st.present.insert(0, size);
            st.dirty.insert(0, size);
        }
        st.size = size;
        st.last_access = Instant::now();
        Ok(())
    }

    /// Mark the item clean after a successful upload.
    pub fn set_clean(&self) {
        self.state.lock().unwrap().dirty.clear();
    }

    async fn write_file(&self, offset: u64, data: &[u8]) -> VfsResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// The per-remote cache index.
#[derive(Debug)]
pub struct CacheManager {
    opts: CacheOpts,
    remote_dir: PathBuf,
    items: Mutex<HashMap<String, Arc<CacheItem>>>,
}

impl CacheManager {
    /// Create the cache directory for `fs_ident` (typically `Fs::string()`).
    pub async fn new(opts: CacheOpts, fs_ident: &str) -> VfsResult<Arc<Self>> {
        let remote_dir = opts.dir.join(sanitize(fs_ident));
        tokio::fs::create_dir_all(&remote_dir).await?;
        Ok(Arc::new(CacheManager {
            opts,
            remote_dir,
            items: Mutex::new(HashMap::new()),
        }))
    }

    pub fn chunk_size(&self) -> u64 {
        self.opts.chunk_size
    }

    /// Look up or create the item for `remote`. References are taken
    /// separately with [`CacheItem::retain`], one per open handle.
    pub fn open(&self, remote: &str) -> Arc<CacheItem> {
        let mut items = self.items.lock().unwrap();
        items
            .entry(remote.to_string())
            .or_insert_with(|| {
                let path = self.remote_dir.join(sanitize(remote));
                debug!(remote, path = %path.display(), "cache item created");
                Arc::new(CacheItem {
                    remote: remote.to_string(),
                    path,
                    refs: AtomicU32::new(0),
                    state: Mutex::new(ItemState {
                        size: 0,
                        present: Ranges::new(),
                        dirty: Ranges::new(),
                        last_access: Instant::now(),
                    }),
                })
            })
            .clone()
    }

    /// Remove a cached object entirely (e.g. after a VFS unlink).
    pub async fn discard(&self, remote: &str) {
        let item = self.items.lock().unwrap().remove(remote);
        if let Some(item) = item {
            let _ = tokio::fs::remove_file(&item.path).await;
        }
    }

    /// Total bytes of present data across all items.
    pub fn used(&self) -> u64 {
        self.items
            .lock()
            .unwrap()
            .values()
            .map(|i| i.state.lock().unwrap().present.size())
            .sum()
    }

    /// Dirty items that have no readers or writers left, ready for upload.
    pub fn flushable(&self) -> Vec<Arc<CacheItem>> {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.is_dirty() && i.refcount() == 0)
            .cloned()
            .collect()
    }

    /// Evict clean, unreferenced items: anything past `max_age`, then
    /// least-recently-used items until the size budget is met. Returns how
    /// many items were removed.
    pub async fn evict(&self) -> usize {
        let victims: Vec<Arc<CacheItem>> = {
            let items = self.items.lock().unwrap();
            let now = Instant::now();

            let mut candidates: Vec<&Arc<CacheItem>> = items
                .values()
                .filter(|i| i.refcount() == 0 && !i.is_dirty())
                .collect();
            candidates.sort_by_key(|i| i.state.lock().unwrap().last_access);

            let mut used: u64 = items
                .values()
                .map(|i| i.state.lock().unwrap().present.size())
                .sum();
            let budget = self.opts.max_size.unwrap_or(u64::MAX);

            let mut victims = Vec::new();
            for item in candidates {
                let st = item.state.lock().unwrap();
                let age = now.duration_since(st.last_access);
                let over_budget = used > budget;
                if age > self.opts.max_age || over_budget {
                    used = used.saturating_sub(st.present.size());
                    drop(st);
                    victims.push(Arc::clone(item));
                }
            }
            victims
        };

        let count = victims.len();
        for item in victims {
            debug!(remote = %item.remote, "evicting cache item");
            self.items.lock().unwrap().remove(&item.remote);
            let _ = tokio::fs::remove_file(&item.path).await;
        }
        count
    }
}

/// Flatten a remote path into a single file name.
fn sanitize(remote: &str) -> String {
    remote
        .chars()
        .map(|c| if c == '/' || c == ':' { '%' } else { c })
        .collect()
}
