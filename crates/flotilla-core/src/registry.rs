//! Backend registry and the process-wide Fs cache.
//!
//! Backends register a factory under their scheme. [`Registry::new_fs`]
//! resolves a `remote:path` specification through the [`ConfigMap`], applies
//! the file-or-directory probe, and memoizes live handles so that repeated
//! opens of the same remote share one `Fs`. Handles can be pinned to keep
//! them across cache sweeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::config::ConfigMap;
use crate::error::{FsError, FsResult};
use crate::fal::Fs;
use crate::path::{parse_remote, split};

/// Constructs one backend's `Fs` handles.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Create a handle named `name` rooted at `root`. Implementations read
    /// their options from `config[name]`.
    async fn make(&self, name: &str, root: &str, config: &ConfigMap) -> FsResult<Arc<dyn Fs>>;
}

/// Result of opening a remote: either a directory-rooted handle, or - when
/// the supplied root resolved to a single object - a handle on the parent
/// plus the leaf name, for callers to apply a single-file filter.
#[derive(Clone, Debug)]
pub enum Created {
    Dir(Arc<dyn Fs>),
    File { fs: Arc<dyn Fs>, leaf: String },
}

impl Created {
    /// The underlying handle regardless of variant.
    pub fn fs(&self) -> &Arc<dyn Fs> {
        match self {
            Created::Dir(fs) => fs,
            Created::File { fs, .. } => fs,
        }
    }

    /// The single-file leaf, when the root named an object.
    pub fn leaf(&self) -> Option<&str> {
        match self {
            Created::Dir(_) => None,
            Created::File { leaf, .. } => Some(leaf),
        }
    }
}

struct CacheSlot {
    fs: Arc<dyn Fs>,
    pins: AtomicUsize,
}

/// Scheme registry plus the Fs handle cache.
#[derive(Default)]
pub struct Registry {
    backends: DashMap<String, Arc<dyn BackendFactory>>,
    cache: DashMap<String, Arc<CacheSlot>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register `factory` under `scheme`. Last registration wins.
    pub fn register(&self, scheme: &str, factory: Arc<dyn BackendFactory>) {
        debug!(scheme, "registering backend");
        self.backends.insert(scheme.to_string(), factory);
    }

    pub fn schemes(&self) -> Vec<String> {
        self.backends.iter().map(|e| e.key().clone()).collect()
    }

    /// Open `spec` (`remote:path` or a local path).
    ///
    /// The scheme is `config[name].type` when the section exists, otherwise
    /// the remote name itself; local paths use the `local` scheme. When the
    /// root resolves to a single object the result points at the parent and
    /// carries the leaf - a distinct variant, never an error.
    pub async fn new_fs(&self, spec: &str, config: &ConfigMap) -> FsResult<Created> {
        let parsed = parse_remote(spec)?;
        let (name, scheme) = match &parsed.remote {
            None => (String::new(), "local".to_string()),
            Some(name) => {
                let scheme = config
                    .get(name, "type")
                    .unwrap_or(name.as_str())
                    .to_string();
                (name.clone(), scheme)
            }
        };
        let factory = self
            .backends
            .get(&scheme)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| FsError::Validation(format!("unknown backend scheme {scheme:?}")))?;

        // File-or-directory probe: try the root as an object of its parent.
        let (parent, leaf) = split(&parsed.path);
        if !leaf.is_empty() && parsed.path != "/" {
            let parent_fs = self
                .cached_make(&factory, &scheme, &name, parent, config)
                .await?;
            match parent_fs.new_object(leaf).await {
                Ok(_) => {
                    debug!(spec, leaf, "root resolves to a single object");
                    return Ok(Created::File {
                        fs: parent_fs,
                        leaf: leaf.to_string(),
                    });
                }
                Err(
                    FsError::ObjectNotFound(_)
                    | FsError::NotAFile(_)
                    | FsError::DirNotFound(_)
                    | FsError::ListBucketRequired(_),
                ) => {}
                Err(e) => return Err(e),
            }
        }

        let fs = self
            .cached_make(&factory, &scheme, &name, &parsed.path, config)
            .await?;
        Ok(Created::Dir(fs))
    }

    async fn cached_make(
        &self,
        factory: &Arc<dyn BackendFactory>,
        scheme: &str,
        name: &str,
        root: &str,
        config: &ConfigMap,
    ) -> FsResult<Arc<dyn Fs>> {
        let key = cache_key(scheme, name, root);
        if let Some(slot) = self.cache.get(&key) {
            return Ok(Arc::clone(&slot.fs));
        }
        let fs = factory.make(name, root, config).await?;
        let slot = Arc::new(CacheSlot {
            fs: Arc::clone(&fs),
            pins: AtomicUsize::new(0),
        });
        self.cache.insert(key, slot);
        Ok(fs)
    }

    /// Pin a cached handle so sweeps keep it.
    pub fn pin(&self, fs: &Arc<dyn Fs>) {
        if let Some(slot) = self.slot_for(fs) {
            slot.pins.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop one pin.
    pub fn unpin(&self, fs: &Arc<dyn Fs>) {
        if let Some(slot) = self.slot_for(fs) {
            slot.pins.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Evict every cache entry with no pins. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, slot| slot.pins.load(Ordering::Relaxed) > 0);
        before - self.cache.len()
    }

    /// Number of live cache entries.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn slot_for(&self, fs: &Arc<dyn Fs>) -> Option<Arc<CacheSlot>> {
        self.cache
            .iter()
            .find(|e| Arc::ptr_eq(&e.value().fs, fs))
            .map(|e| Arc::clone(e.value()))
    }
}

fn cache_key(scheme: &str, name: &str, root: &str) -> String {
    format!("{scheme}\u{1}{name}\u{1}{root}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::fal::{ByteReader, DirEntry, ObjectMeta, OpenOption, Precision};
    use crate::features::Features;
    use flotilla_hash::{HashSet, HashType};

    /// A backend stub with a fixed set of object paths.
    #[derive(Debug)]
    struct StubFs {
        name: String,
        root: String,
        features: Features,
        objects: BTreeSet<String>,
    }

    #[derive(Debug)]
    struct StubObject {
        remote: String,
    }

    #[async_trait]
    impl crate::fal::Object for StubObject {
        fn remote(&self) -> String {
            self.remote.clone()
        }

        fn size(&self) -> u64 {
            0
        }

        fn mod_time(&self) -> chrono::DateTime<Utc> {
            Utc::now()
        }

        async fn hash(&self, _t: HashType) -> FsResult<Option<String>> {
            Ok(None)
        }

        async fn open(&self, _opts: &[OpenOption]) -> FsResult<ByteReader> {
            Ok(Box::new(std::io::Cursor::new(Vec::new())))
        }

        async fn update(&self, _data: ByteReader, _info: &ObjectMeta) -> FsResult<()> {
            Ok(())
        }

        async fn remove(&self) -> FsResult<()> {
            Ok(())
        }

        async fn set_mod_time(&self, _t: chrono::DateTime<Utc>) -> FsResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Fs for StubFs {
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
            HashSet::new()
        }

        fn features(&self) -> &Features {
            &self.features
        }

        async fn list(&self, _dir: &str) -> FsResult<Vec<DirEntry>> {
            Ok(Vec::new())
        }

        async fn new_object(&self, remote: &str) -> FsResult<Arc<dyn crate::fal::Object>> {
            let full = crate::path::join(&self.root, remote);
            if self.objects.contains(&full) {
                Ok(Arc::new(StubObject {
                    remote: remote.to_string(),
                }))
            } else {
                Err(FsError::ObjectNotFound(remote.to_string()))
            }
        }

        async fn put(
            &self,
            _data: ByteReader,
            info: &ObjectMeta,
        ) -> FsResult<Arc<dyn crate::fal::Object>> {
            Ok(Arc::new(StubObject {
                remote: info.remote.clone(),
            }))
        }

        async fn mkdir(&self, _dir: &str) -> FsResult<()> {
            Ok(())
        }

        async fn rmdir(&self, _dir: &str) -> FsResult<()> {
            Ok(())
        }
    }

    struct StubFactory {
        objects: BTreeSet<String>,
    }

    #[async_trait]
    impl BackendFactory for StubFactory {
        async fn make(
            &self,
            name: &str,
            root: &str,
            _config: &ConfigMap,
        ) -> FsResult<Arc<dyn Fs>> {
            Ok(Arc::new(StubFs {
                name: name.to_string(),
                root: root.to_string(),
                features: Features::none(),
                objects: self.objects.clone(),
            }))
        }
    }

    fn registry_with_stub() -> Registry {
        let registry = Registry::new();
        registry.register(
            "stub",
            Arc::new(StubFactory {
                objects: ["data/file.bin".to_string()].into_iter().collect(),
            }),
        );
        registry
    }

    #[tokio::test]
    async fn test_new_fs_directory_root() {
        let registry = registry_with_stub();
        let created = registry
            .new_fs("stub:data", &ConfigMap::new())
            .await
            .unwrap();
        assert!(created.leaf().is_none());
        assert_eq!(created.fs().root(), "data");
    }

    #[tokio::test]
    async fn test_new_fs_file_probe() {
        let registry = registry_with_stub();
        let created = registry
            .new_fs("stub:data/file.bin", &ConfigMap::new())
            .await
            .unwrap();
        assert_eq!(created.leaf(), Some("file.bin"));
        assert_eq!(created.fs().root(), "data");
    }

    #[tokio::test]
    async fn test_new_fs_unknown_scheme() {
        let registry = Registry::new();
        let err = registry
            .new_fs("nope:path", &ConfigMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Validation(_)));
    }

    #[tokio::test]
    async fn test_scheme_resolution_through_config() {
        let registry = registry_with_stub();
        let mut cfg = ConfigMap::new();
        cfg.set("myremote", "type", "stub");
        let created = registry.new_fs("myremote:data", &cfg).await.unwrap();
        assert_eq!(created.fs().name(), "myremote");
    }

    #[tokio::test]
    async fn test_cache_shares_handles() {
        let registry = registry_with_stub();
        let cfg = ConfigMap::new();
        let a = registry.new_fs("stub:data", &cfg).await.unwrap();
        let b = registry.new_fs("stub:data", &cfg).await.unwrap();
        assert!(Arc::ptr_eq(a.fs(), b.fs()));
    }

    #[tokio::test]
    async fn test_pin_survives_sweep() {
        let registry = registry_with_stub();
        let cfg = ConfigMap::new();
        let a = registry.new_fs("stub:data", &cfg).await.unwrap();
        let b = registry.new_fs("stub:other", &cfg).await.unwrap();

        // The probe also caches parent-rooted handles; only the pinned
        // handle survives the sweep.
        registry.pin(a.fs());
        let evicted = registry.sweep();
        assert!(evicted >= 1);
        assert_eq!(registry.cached(), 1);

        // The pinned handle is still shared.
        let a2 = registry.new_fs("stub:data", &cfg).await.unwrap();
        assert!(Arc::ptr_eq(a.fs(), a2.fs()));

        registry.unpin(a.fs());
        registry.sweep();
        assert_eq!(registry.cached(), 0);
        drop(b);
    }
}
