//! In-memory bucket-based backend.
//!
//! Objects live in a flat keyspace (`bucket/path/to/object`) shared by every
//! handle cloned from the same [`MemStore`]. Directories are implicit in
//! object keys except for buckets, which `mkdir` records explicitly. The
//! backend advertises server-side copy, streaming puts, recursive listing
//! and chunked uploads, which makes it the natural double for engine and
//! VFS tests; fault-injection counters simulate transient failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use flotilla_core::config::ConfigMap;
use flotilla_core::error::{FsError, FsResult};
use flotilla_core::fal::{
    ByteReader, ChunkWriter, DirEntry, Directory, Fs, Object, ObjectMeta, OpenOption, Precision,
    Usage,
};
use flotilla_core::features::{ChunkLimits, Features};
use flotilla_core::path::join;
use flotilla_core::registry::BackendFactory;
use flotilla_hash::{hash_bytes, HashSet, HashType};

/// One stored object version.
#[derive(Debug, Clone)]
struct Stored {
    data: Bytes,
    mod_time: DateTime<Utc>,
    hashes: BTreeMap<HashType, String>,
    mime_type: Option<String>,
}

impl Stored {
    fn new(data: Bytes, mod_time: DateTime<Utc>, mime_type: Option<String>) -> Self {
        let hashes = hash_bytes(memfs_hashes(), &data)
            .into_iter()
            .collect();
        Stored {
            data,
            mod_time,
            hashes,
            mime_type,
        }
    }
}

fn memfs_hashes() -> HashSet {
    HashSet::from_types(&[HashType::Md5, HashType::Sha1, HashType::QuickXor])
}

/// The shared keyspace behind one or more [`MemFs`] handles.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: DashMap<String, Stored>,
    buckets: Mutex<BTreeSet<String>>,
    /// Fail the next N mutating calls with a transient error.
    fail_puts: AtomicU32,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemStore::default())
    }

    /// Arrange for the next `n` puts (including chunk writes) to fail with
    /// [`FsError::Transient`].
    pub fn inject_put_failures(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    fn check_put_fault(&self) -> FsResult<()> {
        let prev = self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            Err(FsError::Transient("injected put failure".into()))
        } else {
            Ok(())
        }
    }
}

/// A handle rooted somewhere in a [`MemStore`].
#[derive(Debug, Clone)]
pub struct MemFs {
    name: String,
    root: String,
    store: Arc<MemStore>,
    features: Features,
}

impl MemFs {
    /// A handle on a fresh store, rooted at the top.
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_store(MemStore::new(), name, "")
    }

    /// A handle sharing `store`, rooted at `root`.
    pub fn with_store(store: Arc<MemStore>, name: &str, root: &str) -> Arc<Self> {
        let features = Features {
            copy: true,
            move_obj: true,
            purge: true,
            put_stream: true,
            list_r: true,
            bucket_based: true,
            open_chunk_writer: true,
            can_have_empty_directories: false,
            chunk_limits: ChunkLimits::default(),
            ..Features::none()
        };
        Arc::new(MemFs {
            name: name.to_string(),
            root: root.trim_matches('/').to_string(),
            store,
            features,
        })
    }

    /// Override the advertised chunked-upload limits (test knob).
    pub fn with_chunk_limits(self: &Arc<Self>, limits: ChunkLimits) -> Arc<Self> {
        let mut fs = (**self).clone();
        fs.features.chunk_limits = limits;
        Arc::new(fs)
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    fn full(&self, remote: &str) -> String {
        join(&self.root, remote)
    }

    /// The bucket component of a full key, if any.
    fn bucket_of(full: &str) -> Option<&str> {
        let b = full.split('/').next()?;
        if b.is_empty() {
            None
        } else {
            Some(b)
        }
    }

    fn entry_for(self: &Arc<Self>, key: &str, stored: &Stored) -> DirEntry {
        let remote = key
            .strip_prefix(&self.root)
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or(key)
            .to_string();
        DirEntry::Object(Arc::new(MemObject {
            fs: Arc::clone(self),
            remote,
            size: stored.data.len() as u64,
            mod_time: stored.mod_time,
        }))
    }

    /// Whether `full` (a directory key) exists implicitly or as a bucket.
    fn dir_exists(&self, full: &str) -> bool {
        if full.is_empty() {
            return true;
        }
        if self.store.buckets.lock().unwrap().contains(full) {
            return true;
        }
        let prefix = format!("{full}/");
        self.store
            .objects
            .iter()
            .any(|e| e.key() == full || e.key().starts_with(&prefix))
    }

    fn list_level(self: &Arc<Self>, dir: &str) -> FsResult<Vec<DirEntry>> {
        let full = self.full(dir);
        if !self.dir_exists(&full) {
            return Err(FsError::DirNotFound(dir.to_string()));
        }

        let prefix = if full.is_empty() {
            String::new()
        } else {
            format!("{full}/")
        };

        let mut dirs: BTreeSet<String> = BTreeSet::new();
        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();

        for e in self.store.objects.iter() {
            let Some(rest) = e.key().strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((first, _)) => {
                    dirs.insert(join(dir, first));
                }
                None => {
                    entries.insert(rest.to_string(), self.entry_for(e.key(), e.value()));
                }
            }
        }

        // Made-but-empty buckets show up when listing the top level.
        if full.is_empty() {
            for bucket in self.store.buckets.lock().unwrap().iter() {
                dirs.insert(bucket.clone());
            }
        }

        let mut out: Vec<DirEntry> = dirs
            .into_iter()
            .map(|d| DirEntry::Dir(Directory::new(d, Utc::now())))
            .collect();
        out.extend(entries.into_values());
        out.sort_by_key(|e| e.remote());
        Ok(out)
    }

    async fn store_put(&self, remote: &str, data: Bytes, info: &ObjectMeta) -> FsResult<()> {
        self.store.check_put_fault()?;
        let full = self.full(remote);
        // Objects live inside buckets; a top-level key has nowhere to go.
        if !full.contains('/') {
            return Err(FsError::ListBucketRequired(remote.to_string()));
        }
        trace!(key = %full, size = data.len(), "memfs put");
        self.store
            .objects
            .insert(full, Stored::new(data, info.mod_time, info.mime_type.clone()));
        Ok(())
    }
}

#[async_trait]
impl Fs for MemFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn precision(&self) -> Precision {
        Precision::EXACT
    }

    fn hashes(&self) -> HashSet {
        memfs_hashes()
    }

    fn features(&self) -> &Features {
        &self.features
    }

    async fn list(&self, dir: &str) -> FsResult<Vec<DirEntry>> {
        let this = Arc::new(self.clone());
        this.list_level(dir)
    }

    async fn new_object(&self, remote: &str) -> FsResult<Arc<dyn Object>> {
        let full = self.full(remote);
        match self.store.objects.get(&full) {
            Some(stored) => Ok(Arc::new(MemObject {
                fs: Arc::new(self.clone()),
                remote: remote.to_string(),
                size: stored.data.len() as u64,
                mod_time: stored.mod_time,
            })),
            None => {
                if self.dir_exists(&full) {
                    Err(FsError::NotAFile(remote.to_string()))
                } else {
                    Err(FsError::ObjectNotFound(remote.to_string()))
                }
            }
        }
    }

    async fn put(&self, mut data: ByteReader, info: &ObjectMeta) -> FsResult<Arc<dyn Object>> {
        let mut buf = Vec::with_capacity(info.size.unwrap_or(0) as usize);
        data.read_to_end(&mut buf).await?;
        self.store_put(&info.remote, Bytes::from(buf), info).await?;
        self.new_object(&info.remote).await
    }

    async fn mkdir(&self, dir: &str) -> FsResult<()> {
        let full = self.full(dir);
        let Some(bucket) = Self::bucket_of(&full) else {
            return Ok(());
        };
        // Buckets are the only directories with their own existence;
        // creation is memoized and idempotent.
        let mut buckets = self.store.buckets.lock().unwrap();
        if buckets.insert(bucket.to_string()) {
            debug!(bucket, "memfs bucket created");
        }
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> FsResult<()> {
        let full = self.full(dir);
        if full.is_empty() {
            return Err(FsError::Validation("cannot remove the root".into()));
        }
        let prefix = format!("{full}/");
        if self.store.objects.iter().any(|e| e.key().starts_with(&prefix)) {
            return Err(FsError::DirectoryNotEmpty(dir.to_string()));
        }
        let mut buckets = self.store.buckets.lock().unwrap();
        if !buckets.remove(&full) && !self.dir_exists(&full) {
            return Err(FsError::DirNotFound(dir.to_string()));
        }
        Ok(())
    }

    async fn copy(&self, src: Arc<dyn Object>, remote: &str) -> FsResult<Arc<dyn Object>> {
        let src_full = join(&self.root, &src.remote());
        let stored = self
            .store
            .objects
            .get(&src_full)
            .map(|e| e.value().clone())
            .ok_or_else(|| FsError::ObjectNotFound(src.remote()))?;
        self.store.objects.insert(self.full(remote), stored);
        self.new_object(remote).await
    }

    async fn move_obj(&self, src: Arc<dyn Object>, remote: &str) -> FsResult<Arc<dyn Object>> {
        let src_full = join(&self.root, &src.remote());
        let (_, stored) = self
            .store
            .objects
            .remove(&src_full)
            .ok_or_else(|| FsError::ObjectNotFound(src.remote()))?;
        self.store.objects.insert(self.full(remote), stored);
        self.new_object(remote).await
    }

    async fn purge(&self, dir: &str) -> FsResult<()> {
        let full = self.full(dir);
        if !self.dir_exists(&full) {
            return Err(FsError::DirNotFound(dir.to_string()));
        }
        let prefix = format!("{full}/");
        self.store
            .objects
            .retain(|k, _| !(k == &full || k.starts_with(&prefix)));
        self.store.buckets.lock().unwrap().remove(&full);
        Ok(())
    }

    async fn about(&self) -> FsResult<Usage> {
        let used: u64 = self
            .store
            .objects
            .iter()
            .map(|e| e.value().data.len() as u64)
            .sum();
        Ok(Usage {
            total: None,
            used: Some(used),
            free: None,
        })
    }

    async fn list_recursive(
        &self,
        dir: &str,
        pages: mpsc::Sender<Vec<DirEntry>>,
    ) -> FsResult<()> {
        let this = Arc::new(self.clone());
        let full = self.full(dir);
        if !self.dir_exists(&full) {
            return Err(FsError::DirNotFound(dir.to_string()));
        }
        let prefix = if full.is_empty() {
            String::new()
        } else {
            format!("{full}/")
        };

        let mut dirs: BTreeSet<String> = BTreeSet::new();
        let mut objects: Vec<DirEntry> = Vec::new();
        for e in self.store.objects.iter() {
            let Some(rest) = e.key().strip_prefix(&prefix) else {
                continue;
            };
            // Every ancestor directory of the object is reported once.
            let mut acc = String::new();
            let mut parts = rest.split('/').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    break;
                }
                acc = if acc.is_empty() {
                    part.to_string()
                } else {
                    format!("{acc}/{part}")
                };
                dirs.insert(join(dir, &acc));
            }
            objects.push(this.entry_for(e.key(), e.value()));
        }

        let mut page: Vec<DirEntry> = dirs
            .into_iter()
            .map(|d| DirEntry::Dir(Directory::new(d, Utc::now())))
            .collect();
        page.extend(objects);
        page.sort_by_key(|e| e.remote());

        // Deliver in fixed-size pages the way bucket stores paginate.
        for chunk in page.chunks(1000) {
            if pages.send(chunk.to_vec()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn put_stream(&self, data: ByteReader, info: &ObjectMeta) -> FsResult<Arc<dyn Object>> {
        self.put(data, info).await
    }

    async fn open_chunk_writer(
        &self,
        info: &ObjectMeta,
        chunk_size: u64,
    ) -> FsResult<Box<dyn ChunkWriter>> {
        if chunk_size == 0 {
            return Err(FsError::Validation("chunk size must be positive".into()));
        }
        Ok(Box::new(MemChunkWriter {
            fs: self.clone(),
            info: info.clone(),
            chunk_size,
            parts: Mutex::new(BTreeMap::new()),
        }))
    }
}

/// An object snapshot plus the handle it came from.
#[derive(Debug, Clone)]
pub struct MemObject {
    fs: Arc<MemFs>,
    remote: String,
    size: u64,
    mod_time: DateTime<Utc>,
}

impl MemObject {
    fn stored(&self) -> FsResult<Stored> {
        let full = self.fs.full(&self.remote);
        self.fs
            .store
            .objects
            .get(&full)
            .map(|e| e.value().clone())
            .ok_or_else(|| FsError::ObjectNotFound(self.remote.clone()))
    }
}

#[async_trait]
impl Object for MemObject {
    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mod_time(&self) -> DateTime<Utc> {
        self.mod_time
    }

    async fn hash(&self, t: HashType) -> FsResult<Option<String>> {
        Ok(self.stored()?.hashes.get(&t).cloned())
    }

    fn mime_type(&self) -> Option<String> {
        self.stored().ok().and_then(|s| s.mime_type)
    }

    async fn open(&self, opts: &[OpenOption]) -> FsResult<ByteReader> {
        let stored = self.stored()?;
        let (offset, limit) = OpenOption::reduce(opts);
        let len = stored.data.len() as u64;
        let start = offset.min(len);
        let end = match limit {
            Some(count) => (start + count).min(len),
            None => len,
        };
        let slice = stored.data.slice(start as usize..end as usize);
        Ok(Box::new(std::io::Cursor::new(slice.to_vec())))
    }

    async fn update(&self, mut data: ByteReader, info: &ObjectMeta) -> FsResult<()> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;
        self.fs
            .store_put(&self.remote, Bytes::from(buf), info)
            .await
    }

    async fn remove(&self) -> FsResult<()> {
        let full = self.fs.full(&self.remote);
        self.fs
            .store
            .objects
            .remove(&full)
            .map(|_| ())
            .ok_or_else(|| FsError::ObjectNotFound(self.remote.clone()))
    }

    async fn set_mod_time(&self, t: DateTime<Utc>) -> FsResult<()> {
        let full = self.fs.full(&self.remote);
        match self.fs.store.objects.get_mut(&full) {
            Some(mut e) => {
                e.value_mut().mod_time = t;
                Ok(())
            }
            None => Err(FsError::ObjectNotFound(self.remote.clone())),
        }
    }
}

/// Chunked-upload session: parts accumulate in memory and the commit
/// assembles the manifest atomically.
struct MemChunkWriter {
    fs: MemFs,
    info: ObjectMeta,
    chunk_size: u64,
    parts: Mutex<BTreeMap<u32, Bytes>>,
}

#[async_trait]
impl ChunkWriter for MemChunkWriter {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    async fn write_chunk(&self, index: u32, data: Bytes) -> FsResult<()> {
        self.fs.store.check_put_fault()?;
        let max_parts = self.fs.features.chunk_limits.max_upload_parts;
        if index >= max_parts {
            return Err(FsError::Validation(format!(
                "part {index} exceeds the {max_parts}-part limit"
            )));
        }
        trace!(index, len = data.len(), "memfs chunk accepted");
        self.parts.lock().unwrap().insert(index, data);
        Ok(())
    }

    async fn commit(&self) -> FsResult<Arc<dyn Object>> {
        let parts = std::mem::take(&mut *self.parts.lock().unwrap());
        let mut assembled = Vec::new();
        let mut expected = 0u32;
        for (index, data) in parts {
            if index != expected {
                return Err(FsError::Validation(format!(
                    "missing part {expected} in manifest"
                )));
            }
            assembled.extend_from_slice(&data);
            expected += 1;
        }
        self.fs
            .store_put(&self.info.remote, Bytes::from(assembled), &self.info)
            .await?;
        self.fs.new_object(&self.info.remote).await
    }

    async fn abort(&self) -> FsResult<()> {
        self.parts.lock().unwrap().clear();
        Ok(())
    }
}

/// Registry factory: handles created under the same configured name share a
/// store, so `new_fs("mem:bucket/a")` and `new_fs("mem:bucket")` see the
/// same objects.
#[derive(Debug, Default)]
pub struct MemFsFactory {
    stores: DashMap<String, Arc<MemStore>>,
}

impl MemFsFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(MemFsFactory::default())
    }
}

#[async_trait]
impl BackendFactory for MemFsFactory {
    async fn make(&self, name: &str, root: &str, _config: &ConfigMap) -> FsResult<Arc<dyn Fs>> {
        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(MemStore::new)
            .clone();
        Ok(MemFs::with_store(store, name, root) as Arc<dyn Fs>)
    }
}

/// Convenience: fill a store with `(path, contents, mtime)` fixtures.
pub async fn seed(
    fs: &Arc<MemFs>,
    files: &[(&str, &[u8], DateTime<Utc>)],
) -> FsResult<()> {
    for (remote, data, mtime) in files {
        let info = ObjectMeta::new(*remote, Some(data.len() as u64), *mtime);
        let reader: ByteReader = Box::new(std::io::Cursor::new(data.to_vec()));
        fs.put(reader, &info).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).single().unwrap()
    }

    async fn fixture() -> Arc<MemFs> {
        let fs = MemFs::new("mem");
        seed(
            &fs,
            &[
                ("bucket/a.txt", b"alpha", t0()),
                ("bucket/sub/b.txt", b"bravo", t0()),
                ("bucket/sub/deep/c.txt", b"charlie", t0()),
                ("other/d.txt", b"delta", t0()),
            ],
        )
        .await
        .unwrap();
        fs
    }

    #[tokio::test]
    async fn test_list_levels() {
        let fs = fixture().await;

        let top = fs.list("").await.unwrap();
        let names: Vec<String> = top.iter().map(|e| e.remote()).collect();
        assert_eq!(names, vec!["bucket", "other"]);
        assert!(top.iter().all(|e| e.is_dir()));

        let bucket = fs.list("bucket").await.unwrap();
        let names: Vec<String> = bucket.iter().map(|e| e.remote()).collect();
        assert_eq!(names, vec!["bucket/a.txt", "bucket/sub"]);

        assert!(matches!(
            fs.list("missing").await,
            Err(FsError::DirNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_new_object_and_read() {
        let fs = fixture().await;
        let obj = fs.new_object("bucket/a.txt").await.unwrap();
        assert_eq!(obj.size(), 5);

        let mut reader = obj.open(&[]).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"alpha");

        assert!(matches!(
            fs.new_object("bucket/nope").await,
            Err(FsError::ObjectNotFound(_))
        ));
        assert!(matches!(
            fs.new_object("bucket/sub").await,
            Err(FsError::NotAFile(_))
        ));
    }

    #[tokio::test]
    async fn test_open_with_range() {
        let fs = fixture().await;
        let obj = fs.new_object("bucket/sub/b.txt").await.unwrap();

        let mut reader = obj
            .open(&[OpenOption::Range {
                offset: 1,
                count: Some(3),
            }])
            .await
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"rav");

        let mut reader = obj.open(&[OpenOption::Seek(3)]).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"vo");
    }

    #[tokio::test]
    async fn test_put_requires_bucket() {
        let fs = MemFs::new("mem");
        let info = ObjectMeta::new("rootfile", Some(1), t0());
        let reader: ByteReader = Box::new(std::io::Cursor::new(vec![1u8]));
        assert!(matches!(
            fs.put(reader, &info).await,
            Err(FsError::ListBucketRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_hashes_stored_as_hex() {
        let fs = MemFs::new("mem");
        seed(&fs, &[("b/fourteen", &[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14], t0())])
            .await
            .unwrap();
        let obj = fs.new_object("b/fourteen").await.unwrap();
        assert_eq!(
            obj.hash(HashType::Md5).await.unwrap().as_deref(),
            Some("bf13fc19e5151ac57d4252e0e0f87abe")
        );
        assert_eq!(
            obj.hash(HashType::QuickXor).await.unwrap().as_deref(),
            Some("0110c000085000031c0001095ec00218d0000700")
        );
        // Families outside the advertised set are unknown.
        assert_eq!(obj.hash(HashType::Whirlpool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mkdir_rmdir_buckets() {
        let fs = MemFs::new("mem");
        fs.mkdir("newbucket").await.unwrap();
        fs.mkdir("newbucket").await.unwrap(); // idempotent

        let top = fs.list("").await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].remote(), "newbucket");

        fs.rmdir("newbucket").await.unwrap();
        assert!(fs.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rmdir_refuses_nonempty() {
        let fs = fixture().await;
        assert!(matches!(
            fs.rmdir("bucket").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn test_server_side_copy_and_move() {
        let fs = fixture().await;
        let src = fs.new_object("bucket/a.txt").await.unwrap();

        let copied = fs.copy(src.clone(), "bucket/a-copy.txt").await.unwrap();
        assert_eq!(copied.size(), 5);
        assert!(fs.new_object("bucket/a.txt").await.is_ok());

        let moved = fs.move_obj(src, "other/a-moved.txt").await.unwrap();
        assert_eq!(moved.remote(), "other/a-moved.txt");
        assert!(matches!(
            fs.new_object("bucket/a.txt").await,
            Err(FsError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge() {
        let fs = fixture().await;
        fs.purge("bucket/sub").await.unwrap();
        assert!(matches!(
            fs.new_object("bucket/sub/b.txt").await,
            Err(FsError::ObjectNotFound(_))
        ));
        assert!(fs.new_object("bucket/a.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_recursive_pages() {
        let fs = fixture().await;
        let (tx, mut rx) = mpsc::channel(4);
        fs.list_recursive("bucket", tx).await.unwrap();

        let mut all = Vec::new();
        while let Some(page) = rx.recv().await {
            all.extend(page);
        }
        let names: Vec<String> = all.iter().map(|e| e.remote()).collect();
        assert_eq!(
            names,
            vec![
                "bucket/a.txt",
                "bucket/sub",
                "bucket/sub/b.txt",
                "bucket/sub/deep",
                "bucket/sub/deep/c.txt",
            ]
        );
    }

    #[tokio::test]
    async fn test_chunk_writer_round_trip() {
        let fs = fixture().await;
        let info = ObjectMeta::new("bucket/big.bin", Some(10), t0());
        let writer = fs.open_chunk_writer(&info, 4).await.unwrap();

        // Parts written out of order still assemble correctly.
        writer.write_chunk(2, Bytes::from_static(b"89")).await.unwrap();
        writer.write_chunk(0, Bytes::from_static(b"0123")).await.unwrap();
        writer.write_chunk(1, Bytes::from_static(b"4567")).await.unwrap();

        let obj = writer.commit().await.unwrap();
        assert_eq!(obj.size(), 10);

        let mut reader = obj.open(&[]).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"0123456789");
    }

    #[tokio::test]
    async fn test_chunk_writer_missing_part() {
        let fs = fixture().await;
        let info = ObjectMeta::new("bucket/gap.bin", Some(8), t0());
        let writer = fs.open_chunk_writer(&info, 4).await.unwrap();
        writer.write_chunk(0, Bytes::from_static(b"0123")).await.unwrap();
        writer.write_chunk(2, Bytes::from_static(b"89")).await.unwrap();
        assert!(writer.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_put_fault_injection() {
        let fs = fixture().await;
        fs.store().inject_put_failures(1);

        let info = ObjectMeta::new("bucket/x.bin", Some(1), t0());
        let reader: ByteReader = Box::new(std::io::Cursor::new(vec![0u8]));
        let err = fs.put(reader, &info).await.unwrap_err();
        assert!(err.is_retryable());

        // The next attempt succeeds.
        let reader: ByteReader = Box::new(std::io::Cursor::new(vec![0u8]));
        fs.put(reader, &info).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_mod_time() {
        let fs = fixture().await;
        let obj = fs.new_object("bucket/a.txt").await.unwrap();
        let new_time = t0() + chrono::Duration::hours(1);
        obj.set_mod_time(new_time).await.unwrap();

        let fresh = fs.new_object("bucket/a.txt").await.unwrap();
        assert_eq!(fresh.mod_time(), new_time);
    }

    #[tokio::test]
    async fn test_shared_store_between_handles() {
        let store = MemStore::new();
        let a = MemFs::with_store(Arc::clone(&store), "mem", "");
        let b = MemFs::with_store(store, "mem", "bucket");

        seed(&a, &[("bucket/shared.txt", b"x", t0())]).await.unwrap();
        let obj = b.new_object("shared.txt").await.unwrap();
        assert_eq!(obj.size(), 1);
    }
}
