//! The backend contract: `Fs`, `Object` and the entry types between them.
//!
//! A backend is a named capability bundle. The required operations live on
//! the [`Fs`] trait; optional operations are default methods returning
//! [`FsError::NotSupported`] that a backend overrides when the matching
//! [`Features`] flag is advertised. The generic engine never downcasts a
//! backend - capability is expressed only through the features record.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use flotilla_hash::{HashSet, HashType};

use crate::error::{FsError, FsResult};
use crate::features::Features;

/// Boxed byte stream flowing out of `Object::open` and into `Fs::put`.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// The smallest modification-time delta a backend can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Mtimes round-trip within this granularity.
    Granular(Duration),
    /// The backend cannot store modification times at all.
    NotSupported,
}

impl Precision {
    /// Nanosecond precision (local disk).
    pub const EXACT: Precision = Precision::Granular(Duration::from_nanos(1));

    /// The granularity, or `None` when mtimes are unsupported.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Precision::Granular(d) => Some(d),
            Precision::NotSupported => None,
        }
    }
}

/// Options applied when opening an object for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Read `count` bytes starting at `offset`; `count == None` reads to the
    /// end.
    Range { offset: u64, count: Option<u64> },
    /// Read from `offset` to the end.
    Seek(u64),
}

impl OpenOption {
    /// Collapse a set of options into a single `(offset, limit)` pair.
    /// Later options win, matching the order backends receive them.
    pub fn reduce(opts: &[OpenOption]) -> (u64, Option<u64>) {
        let mut offset = 0u64;
        let mut limit = None;
        for opt in opts {
            match *opt {
                OpenOption::Range { offset: o, count } => {
                    offset = o;
                    limit = count;
                }
                OpenOption::Seek(o) => {
                    offset = o;
                    limit = None;
                }
            }
        }
        (offset, limit)
    }
}

/// Static metadata describing an object to be written.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Path relative to the destination Fs root.
    pub remote: String,
    /// Payload size; `None` for streaming uploads of unknown length.
    pub size: Option<u64>,
    /// Modification time to record on the stored object.
    pub mod_time: DateTime<Utc>,
    /// Digests known before upload, used for server-side verification.
    pub hashes: HashMap<HashType, String>,
    pub mime_type: Option<String>,
    /// User metadata; the `mtime` key follows the conventions in
    /// [`crate::meta`].
    pub metadata: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Metadata with just a path, a size and a timestamp.
    pub fn new(remote: impl Into<String>, size: Option<u64>, mod_time: DateTime<Utc>) -> Self {
        ObjectMeta {
            remote: remote.into(),
            size,
            mod_time,
            hashes: HashMap::new(),
            mime_type: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a known digest.
    #[must_use]
    pub fn with_hash(mut self, t: HashType, hex: impl Into<String>) -> Self {
        self.hashes.insert(t, hex.into());
        self
    }
}

/// An immutable view of one stored file at a specific version.
#[async_trait]
pub trait Object: Send + Sync + fmt::Debug {
    /// Path relative to the owning Fs root.
    fn remote(&self) -> String;

    /// Size in bytes.
    fn size(&self) -> u64;

    /// Modification time of this version.
    fn mod_time(&self) -> DateTime<Utc>;

    /// The digest of the stored content for family `t`, or `None` when the
    /// backend does not know it. Backends may read the content to answer.
    async fn hash(&self, t: HashType) -> FsResult<Option<String>>;

    /// MIME type, when the backend stores one.
    fn mime_type(&self) -> Option<String> {
        None
    }

    /// Backend-native identifier, when one exists.
    fn id(&self) -> Option<String> {
        None
    }

    /// Open the content for reading, honoring range/seek options.
    async fn open(&self, opts: &[OpenOption]) -> FsResult<ByteReader>;

    /// Replace the content in place.
    async fn update(&self, data: ByteReader, info: &ObjectMeta) -> FsResult<()>;

    /// Delete the stored object.
    async fn remove(&self) -> FsResult<()>;

    /// Update the stored modification time. Backends whose precision is
    /// [`Precision::NotSupported`] return [`FsError::CantSetModTime`].
    async fn set_mod_time(&self, t: DateTime<Utc>) -> FsResult<()>;
}

/// A passive directory entry; directories are re-listed through the Fs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    /// Path relative to the owning Fs root.
    pub remote: String,
    pub mod_time: DateTime<Utc>,
}

impl Directory {
    pub fn new(remote: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        Directory {
            remote: remote.into(),
            mod_time,
        }
    }
}

/// One entry from a directory listing.
#[derive(Clone)]
pub enum DirEntry {
    Object(Arc<dyn Object>),
    Dir(Directory),
}

impl DirEntry {
    /// Path relative to the owning Fs root.
    pub fn remote(&self) -> String {
        match self {
            DirEntry::Object(o) => o.remote(),
            DirEntry::Dir(d) => d.remote.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, DirEntry::Dir(_))
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        match self {
            DirEntry::Object(o) => o.mod_time(),
            DirEntry::Dir(d) => d.mod_time,
        }
    }
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirEntry::Object(o) => write!(f, "Object({})", o.remote()),
            DirEntry::Dir(d) => write!(f, "Dir({})", d.remote),
        }
    }
}

/// Storage quota as reported by `Fs::about`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
}

/// Writer for one chunked upload: parts are independent retryable units,
/// committed as a manifest once every part has been acknowledged.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    /// The part size this writer was opened with.
    fn chunk_size(&self) -> u64;

    /// Upload part `index` (zero-based). Safe to call concurrently for
    /// distinct indexes and to retry for the same index.
    async fn write_chunk(&self, index: u32, data: Bytes) -> FsResult<()>;

    /// Commit the manifest; the object becomes visible atomically.
    async fn commit(&self) -> FsResult<Arc<dyn Object>>;

    /// Abandon the upload, releasing server-side session state.
    async fn abort(&self) -> FsResult<()>;
}

/// The live handle to a remote rooted at a path.
///
/// `name`, `root`, `precision`, `hashes` and `features` are total and
/// constant for the handle's lifetime; a capability either is present for
/// the handle's entire life or never.
#[async_trait]
pub trait Fs: Send + Sync + fmt::Debug {
    /// The configured remote name (`""` for ad-hoc local paths).
    fn name(&self) -> &str;

    /// The path this handle is rooted at.
    fn root(&self) -> &str;

    /// Human-readable identity, `name:root`.
    fn string(&self) -> String {
        format!("{}:{}", self.name(), self.root())
    }

    /// Modification-time granularity of the backend.
    fn precision(&self) -> Precision;

    /// Hash families the backend can report for stored objects.
    fn hashes(&self) -> HashSet;

    /// The optional-capability record. Fixed for the handle's lifetime.
    fn features(&self) -> &Features;

    /// List one complete directory level. `dir` is relative to the root,
    /// `""` for the root itself. Fails with [`FsError::DirNotFound`] when
    /// the directory does not exist.
    async fn list(&self, dir: &str) -> FsResult<Vec<DirEntry>>;

    /// Exact object lookup; [`FsError::ObjectNotFound`] on absence.
    async fn new_object(&self, remote: &str) -> FsResult<Arc<dyn Object>>;

    /// Stream an upload, creating parent directories as required when the
    /// backend cannot represent them.
    async fn put(&self, data: ByteReader, info: &ObjectMeta) -> FsResult<Arc<dyn Object>>;

    /// Create a directory. Idempotent: succeeding on an existing directory
    /// is not an error.
    async fn mkdir(&self, dir: &str) -> FsResult<()>;

    /// Remove an empty directory; [`FsError::DirectoryNotEmpty`] otherwise.
    async fn rmdir(&self, dir: &str) -> FsResult<()>;

    // ------------------------------------------------------------------
    // Optional operations, gated by the features record
    // ------------------------------------------------------------------

    /// Server-side copy of `src` (an object of this same backend) to
    /// `remote`.
    async fn copy(&self, _src: Arc<dyn Object>, _remote: &str) -> FsResult<Arc<dyn Object>> {
        Err(FsError::CantCopy)
    }

    /// Server-side move of `src` to `remote`.
    async fn move_obj(&self, _src: Arc<dyn Object>, _remote: &str) -> FsResult<Arc<dyn Object>> {
        Err(FsError::CantMove)
    }

    /// Server-side move of the whole directory `src_dir` (on `src_fs`, which
    /// must be the same backend) to `dst_dir` on this Fs.
    async fn dir_move(
        &self,
        _src_fs: Arc<dyn Fs>,
        _src_dir: &str,
        _dst_dir: &str,
    ) -> FsResult<()> {
        Err(FsError::CantDirMove)
    }

    /// Delete a directory tree and all contents in one operation.
    async fn purge(&self, _dir: &str) -> FsResult<()> {
        Err(FsError::NotSupported("purge"))
    }

    /// Quota information.
    async fn about(&self) -> FsResult<Usage> {
        Err(FsError::NotSupported("about"))
    }

    /// Recursively enumerate `dir`, sending listing pages as they are
    /// produced. Backends that can enumerate a subtree in one call
    /// advertise `Features::list_r` and override this.
    async fn list_recursive(
        &self,
        _dir: &str,
        _pages: mpsc::Sender<Vec<DirEntry>>,
    ) -> FsResult<()> {
        Err(FsError::NotSupported("list_recursive"))
    }

    /// Upload a stream of unknown length.
    async fn put_stream(&self, _data: ByteReader, _info: &ObjectMeta) -> FsResult<Arc<dyn Object>> {
        Err(FsError::NotSupported("put_stream"))
    }

    /// Release leaked server-side state (abandoned upload sessions, trash).
    async fn clean_up(&self) -> FsResult<()> {
        Err(FsError::NotSupported("clean_up"))
    }

    /// Create a time-limited public link to an object.
    async fn public_link(&self, _remote: &str, _expire: Duration) -> FsResult<String> {
        Err(FsError::NotSupported("public_link"))
    }

    /// Open a chunked-upload session for `info.remote`.
    async fn open_chunk_writer(
        &self,
        _info: &ObjectMeta,
        _chunk_size: u64,
    ) -> FsResult<Box<dyn ChunkWriter>> {
        Err(FsError::NotSupported("open_chunk_writer"))
    }

    /// Update a directory's modification time.
    async fn dir_set_mod_time(&self, _dir: &str, _mod_time: DateTime<Utc>) -> FsResult<()> {
        Err(FsError::NotSupported("dir_set_mod_time"))
    }
}
