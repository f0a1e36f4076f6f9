//! The in-memory node arena.
//!
//! Nodes are kept in a table keyed by stable numeric ids; parents and
//! children refer to each other by id only, never by owning pointers, so the
//! handle ↔ file ↔ directory web stays cycle-free. File content state is
//! shared between open handles through an `Arc<Mutex<FileContent>>` hanging
//! off the file node.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::CacheItem;

pub type NodeId = u64;

/// The root directory's id.
pub const ROOT: NodeId = 1;

/// Where a file's bytes currently live.
pub enum FileContent {
    /// No local data; reads stream from the remote object.
    Remote,
    /// Whole content buffered in memory (cache modes Off/Minimal).
    Memory(Vec<u8>),
    /// Backed by an on-disk cache item (cache modes Writes/Full).
    Cached(Arc<CacheItem>),
}

pub struct DirNode {
    pub children: BTreeMap<String, NodeId>,
    /// Whether children were populated from a remote listing.
    pub listed: bool,
    pub mod_time: DateTime<Utc>,
    /// Set while anything beneath holds unflushed writes.
    pub dirty: bool,
}

pub struct FileNode {
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// Unflushed local writes exist.
    pub dirty: bool,
    /// True when a remote object backs this node.
    pub exists_remote: bool,
    pub open_handles: u32,
    pub content: Arc<AsyncMutex<FileContent>>,
}

pub enum NodeKind {
    Dir(DirNode),
    File(FileNode),
}

pub struct Node {
    pub parent: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }
}

/// Point-in-time public view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub dirty: bool,
}

/// Arena of nodes keyed by stable indices.
pub struct NodeTable {
    nodes: DashMap<NodeId, Node>,
    next: AtomicU64,
}

impl NodeTable {
    pub fn new() -> Self {
        let nodes = DashMap::new();
        nodes.insert(
            ROOT,
            Node {
                parent: ROOT,
                name: String::new(),
                kind: NodeKind::Dir(DirNode {
                    children: BTreeMap::new(),
                    listed: false,
                    mod_time: Utc::now(),
                    dirty: false,
                }),
            },
        );
        NodeTable {
            nodes,
            next: AtomicU64::new(ROOT + 1),
        }
    }

    /// Insert a node under `parent`, replacing any same-named child.
    pub fn insert(&self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.nodes.insert(
            id,
            Node {
                parent,
                name: name.to_string(),
                kind,
            },
        );
        if let Some(mut p) = self.nodes.get_mut(&parent) {
            if let NodeKind::Dir(dir) = &mut p.kind {
                if let Some(old) = dir.children.insert(name.to_string(), id) {
                    drop(p);
                    self.nodes.remove(&old);
                }
            }
        }
        id
    }

    /// Remove `id` and detach it from its parent.
    pub fn remove(&self, id: NodeId) {
        if id == ROOT {
            return;
        }
        if let Some((_, node)) = self.nodes.remove(&id) {
            if let Some(mut p) = self.nodes.get_mut(&node.parent) {
                if let NodeKind::Dir(dir) = &mut p.kind {
                    dir.children.remove(&node.name);
                }
            }
        }
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let p = self.nodes.get(&parent)?;
        match &p.kind {
            NodeKind::Dir(dir) => dir.children.get(name).copied(),
            NodeKind::File(_) => None,
        }
    }

    /// Run `f` against the node, if it exists.
    pub fn with<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.nodes.get(&id).map(|n| f(&n))
    }

    /// Run `f` against the node mutably, if it exists.
    pub fn with_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.get_mut(&id).map(|mut n| f(&mut n))
    }

    /// Reconstruct the slash path of a node by walking parents.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = id;
        while cursor != ROOT {
            let Some(node) = self.nodes.get(&cursor) else {
                break;
            };
            parts.push(node.name.clone());
            cursor = node.parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Mark every directory from `id` up to the root dirty (or clean when
    /// `dirty` is false and no dirty sibling remains - the cheap version
    /// here only propagates setting, clearing happens wholesale on flush).
    pub fn propagate_dirty(&self, mut id: NodeId) {
        loop {
            let Some(parent) = self.with(id, |n| n.parent) else {
                break;
            };
            if id == ROOT {
                break;
            }
            self.with_mut(parent, |n| {
                if let NodeKind::Dir(dir) = &mut n.kind {
                    dir.dirty = true;
                }
            });
            id = parent;
        }
    }

    /// Clear directory dirty flags (after a full flush).
    pub fn clear_dir_dirty(&self) {
        for mut entry in self.nodes.iter_mut() {
            if let NodeKind::Dir(dir) = &mut entry.kind {
                dir.dirty = false;
            }
        }
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}
