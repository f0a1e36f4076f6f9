//! Local disk backend.
//!
//! A handle is rooted at a directory; remotes are slash-separated paths
//! beneath it. Modification times are preserved to nanosecond precision,
//! digests are computed by streaming the file, and moves are renames. Paths
//! may not escape the root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use tracing::{debug, trace};

use flotilla_core::config::ConfigMap;
use flotilla_core::error::{FsError, FsResult};
use flotilla_core::fal::{
    ByteReader, DirEntry, Directory, Fs, Object, ObjectMeta, OpenOption, Precision,
};
use flotilla_core::features::Features;
use flotilla_core::path::join;
use flotilla_core::registry::BackendFactory;
use flotilla_hash::{multihasher, HashSet, HashType};

/// A handle on a directory of the local filesystem.
#[derive(Debug)]
pub struct LocalFs {
    name: String,
    root: PathBuf,
    root_str: String,
    features: Features,
}

impl LocalFs {
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Arc<Self> {
        let root: PathBuf = root.into();
        let features = Features {
            move_obj: true,
            dir_move: true,
            can_have_empty_directories: true,
            ..Features::none()
        };
        Arc::new(LocalFs {
            name: name.to_string(),
            root_str: root.to_string_lossy().into_owned(),
            root,
            features,
        })
    }

    /// Resolve `remote` beneath the root, rejecting traversal outside it.
    fn resolve(&self, remote: &str) -> FsResult<PathBuf> {
        let mut path = self.root.clone();
        for part in remote.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(FsError::Validation(format!(
                        "path {remote:?} escapes the root"
                    )))
                }
                part => path.push(part),
            }
        }
        Ok(path)
    }

    async fn metadata_entry(
        self: &Arc<Self>,
        remote: String,
        meta: &std::fs::Metadata,
    ) -> DirEntry {
        let mod_time = system_to_utc(meta.modified().ok());
        if meta.is_dir() {
            DirEntry::Dir(Directory::new(remote, mod_time))
        } else {
            DirEntry::Object(Arc::new(LocalObject {
                fs: Arc::clone(self),
                remote,
                size: meta.len(),
                mod_time,
            }))
        }
    }
}

fn system_to_utc(t: Option<SystemTime>) -> DateTime<Utc> {
    t.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now)
}

fn map_io_notfound_dir(err: std::io::Error, dir: &str) -> FsError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FsError::DirNotFound(dir.to_string())
    } else {
        FsError::Io(err)
    }
}

#[async_trait]
impl Fs for LocalFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        &self.root_str
    }

    fn precision(&self) -> Precision {
        Precision::EXACT
    }

    fn hashes(&self) -> HashSet {
        HashType::supported()
    }

    fn features(&self) -> &Features {
        &self.features
    }

    async fn list(&self, dir: &str) -> FsResult<Vec<DirEntry>> {
        let this = Arc::new(self.clone_handle());
        let path = self.resolve(dir)?;
        let mut rd = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| map_io_notfound_dir(e, dir))?;

        let mut entries = Vec::new();
        while let Some(item) = rd.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                // Names that are not valid UTF-8 are invisible to the
                // logical namespace.
                debug!(?name, "skipping non-UTF-8 entry");
                continue;
            };
            let meta = item.metadata().await?;
            entries.push(this.metadata_entry(join(dir, name), &meta).await);
        }
        entries.sort_by_key(|e| e.remote());
        Ok(entries)
    }

    async fn new_object(&self, remote: &str) -> FsResult<Arc<dyn Object>> {
        let this = Arc::new(self.clone_handle());
        let path = self.resolve(remote)?;
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::ObjectNotFound(remote.to_string())
            } else {
                FsError::Io(e)
            }
        })?;
        if meta.is_dir() {
            return Err(FsError::NotAFile(remote.to_string()));
        }
        Ok(Arc::new(LocalObject {
            fs: this,
            remote: remote.to_string(),
            size: meta.len(),
            mod_time: system_to_utc(meta.modified().ok()),
        }))
    }

    async fn put(&self, mut data: ByteReader, info: &ObjectMeta) -> FsResult<Arc<dyn Object>> {
        let path = self.resolve(&info.remote)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        trace!(path = %path.display(), "local put");
        let mut file = tokio::fs::File::create(&path).await?;
        tokio::io::copy(&mut data, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        set_path_mtime(&path, info.mod_time)?;
        self.new_object(&info.remote).await
    }

    async fn mkdir(&self, dir: &str) -> FsResult<()> {
        let path = self.resolve(dir)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> FsResult<()> {
        let path = self.resolve(dir)?;
        let mut rd = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| map_io_notfound_dir(e, dir))?;
        if rd.next_entry().await?.is_some() {
            return Err(FsError::DirectoryNotEmpty(dir.to_string()));
        }
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|e| map_io_notfound_dir(e, dir))
    }

    async fn move_obj(&self, src: Arc<dyn Object>, remote: &str) -> FsResult<Arc<dyn Object>> {
        let from = self.resolve(&src.remote())?;
        let to = self.resolve(remote)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from, &to).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::ObjectNotFound(src.remote())
            } else {
                FsError::Io(e)
            }
        })?;
        self.new_object(remote).await
    }

    async fn dir_move(
        &self,
        src_fs: Arc<dyn Fs>,
        src_dir: &str,
        dst_dir: &str,
    ) -> FsResult<()> {
        // Renames only work within one local handle's mount; a different
        // backend behind `src_fs` cannot be rearranged server-side.
        if src_fs.name() != self.name() {
            return Err(FsError::CantDirMove);
        }
        let from = Path::new(src_fs.root()).join(
            src_dir
                .split('/')
                .filter(|p| !p.is_empty() && *p != ".")
                .collect::<PathBuf>(),
        );
        let to = self.resolve(dst_dir)?;
        if to.exists() {
            return Err(FsError::CantDirMove);
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| map_io_notfound_dir(e, src_dir))
    }
}

impl LocalFs {
    fn clone_handle(&self) -> LocalFs {
        LocalFs {
            name: self.name.clone(),
            root: self.root.clone(),
            root_str: self.root_str.clone(),
            features: self.features.clone(),
        }
    }
}

fn set_path_mtime(path: &Path, t: DateTime<Utc>) -> FsResult<()> {
    let ft = FileTime::from_unix_time(t.timestamp(), t.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, ft).map_err(FsError::Io)
}

/// One file beneath a [`LocalFs`] root.
#[derive(Debug)]
pub struct LocalObject {
    fs: Arc<LocalFs>,
    remote: String,
    size: u64,
    mod_time: DateTime<Utc>,
}

#[async_trait]
impl Object for LocalObject {
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
        let path = self.fs.resolve(&self.remote)?;
        let mut file = tokio::fs::File::open(&path).await?;
        let mut sums =
            multihasher::hash_reader(flotilla_hash::HashSet::new().add(t), &mut file).await?;
        Ok(sums.remove(&t))
    }

    async fn open(&self, opts: &[OpenOption]) -> FsResult<ByteReader> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let path = self.fs.resolve(&self.remote)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::ObjectNotFound(self.remote.clone())
            } else {
                FsError::Io(e)
            }
        })?;

        let (offset, limit) = OpenOption::reduce(opts);
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        match limit {
            Some(count) => Ok(Box::new(file.take(count))),
            None => Ok(Box::new(file)),
        }
    }

    async fn update(&self, data: ByteReader, info: &ObjectMeta) -> FsResult<()> {
        let mut info = info.clone();
        info.remote = self.remote.clone();
        self.fs.put(data, &info).await.map(|_| ())
    }

    async fn remove(&self) -> FsResult<()> {
        let path = self.fs.resolve(&self.remote)?;
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::ObjectNotFound(self.remote.clone())
            } else {
                FsError::Io(e)
            }
        })
    }

    async fn set_mod_time(&self, t: DateTime<Utc>) -> FsResult<()> {
        let path = self.fs.resolve(&self.remote)?;
        set_path_mtime(&path, t)
    }
}

/// Registry factory for `local` paths.
#[derive(Debug, Default)]
pub struct LocalFsFactory;

impl LocalFsFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalFsFactory)
    }
}

#[async_trait]
impl BackendFactory for LocalFsFactory {
    async fn make(&self, name: &str, root: &str, _config: &ConfigMap) -> FsResult<Arc<dyn Fs>> {
        Ok(LocalFs::new(name, root) as Arc<dyn Fs>)
    }
}
